//! Daemon command: wire everything together and run until signalled.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::cmd_abstraction::{CommandExecutor, RealCommandExecutor};
use crate::config::Config;
use crate::conntrack::ConntrackController;
use crate::enforcer::{check_root, FirewallManager};
use crate::lock::LockGuard;
use crate::notify::{hostname, NoopNotifier, Notifier, WebhookNotifier};
use crate::orchestrator::{Orchestrator, Settings};
use crate::signal::wait_for_shutdown;
use crate::store::BlockStore;
use crate::watcher::{LineParser, LogWatcher};

/// Pending violations between the log watcher and the orchestrator.
const EVENT_QUEUE: usize = 1024;

/// Run the daemon
pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    check_root()?;

    let _lock = LockGuard::acquire(&config.lock_path())?;

    let executor: Arc<dyn CommandExecutor> = Arc::new(RealCommandExecutor::new());

    // Fatal when no backend at all is usable.
    let firewall = Arc::new(FirewallManager::new(&config.block_mode, executor.clone()).await?);

    let conntrack = {
        let controller = ConntrackController::new(executor.clone());
        match controller.initialize().await {
            Ok(()) => Some(Arc::new(controller)),
            Err(e) => {
                warn!(
                    "Connection tracking unavailable, established flows will not be dropped: {:#}",
                    e
                );
                None
            }
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(BlockStore::open(&config.storage_dir, clock.clone())?);

    let notifier: Arc<dyn Notifier> = if config.webhook.enabled {
        Arc::new(WebhookNotifier::new(
            &config.webhook,
            config.compiled_username_regex()?,
            hostname(),
        )?)
    } else {
        Arc::new(NoopNotifier)
    };

    let orchestrator = Orchestrator::new(
        store.clone(),
        firewall.clone(),
        conntrack,
        notifier,
        clock,
        Settings::from_config(&config)?,
    );
    let mut tasks = orchestrator.start()?;

    let (tx, mut rx) = mpsc::channel(EVENT_QUEUE);
    let watcher = LogWatcher::new(&config.log_file, LineParser::new(&config.torrent_tag));
    tasks.push(tokio::spawn(async move {
        if let Err(e) = watcher.run(tx).await {
            error!("Log watcher stopped: {:#}", e);
        }
    }));

    let events = orchestrator.clone();
    tasks.push(tokio::spawn(async move {
        while let Some(violation) = rx.recv().await {
            if let Err(e) = events.handle_violation(&violation).await {
                warn!(
                    "Could not handle violation by {} from {}: {:#}",
                    violation.username, violation.address, e
                );
            }
        }
    }));

    info!(
        "tblocker started: backend={}, log={}, tag=[{}], duration={}m, {} stored block(s)",
        firewall.name(),
        config.log_file.display(),
        config.torrent_tag,
        config.block_duration,
        store.len()
    );

    wait_for_shutdown().await;

    for task in tasks {
        task.abort();
    }

    // Kernel rules stay in place; the next start re-arms their timers.
    info!("tblocker stopped with {} address(es) still blocked", store.len());
    Ok(())
}
