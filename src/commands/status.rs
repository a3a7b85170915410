//! Status command implementation.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::cmd_abstraction::{CommandExecutor, RealCommandExecutor};
use crate::config::Config;
use crate::conntrack::ConntrackController;
use crate::enforcer::{check_root, FirewallManager};
use crate::store::{BlockStore, BlockedAddress};

/// Run the status command
pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let clock = Arc::new(SystemClock);
    let store = BlockStore::open(&config.storage_dir, clock.clone())?;
    let now = clock.now();

    println!();
    println!("Store: {}", store.path().display());
    println!("Stored blocks: {}", store.len());

    let is_root = check_root().is_ok();
    let executor: Arc<dyn CommandExecutor> = Arc::new(RealCommandExecutor::new());

    let live = if is_root {
        // Initializing re-creates the chain/table if something removed it.
        let firewall = FirewallManager::new(&config.block_mode, executor.clone()).await?;
        println!("Backend: {}", firewall.name());
        Some(firewall.blocked_ips().await?)
    } else {
        println!("Backend: unknown (run as root to inspect the firewall)");
        None
    };

    let flows = if is_root {
        tracked_flows(&ConntrackController::new(executor), &store.active(now)).await
    } else {
        None
    };
    println!();

    for line in render_entries(&store.list(), live.as_ref(), flows.as_ref(), now) {
        println!("{}", line);
    }

    if let Some(live) = &live {
        let stored: HashSet<String> = store.list().into_iter().map(|e| e.address).collect();
        let unmanaged = live.iter().filter(|ip| !stored.contains(*ip)).count();
        println!();
        println!("Live firewall entries: {}", live.len());
        if unmanaged > 0 {
            println!("Not in store: {}", unmanaged);
        }
    }

    println!();
    Ok(())
}

/// Tracked flow count per active address, `None` when conntrack is unusable.
async fn tracked_flows(
    conntrack: &ConntrackController,
    entries: &[BlockedAddress],
) -> Option<HashMap<String, usize>> {
    if !conntrack.check_available().await {
        return None;
    }
    let mut flows = HashMap::new();
    for entry in entries {
        match conntrack.connection_count(&entry.address).await {
            Ok(count) => {
                flows.insert(entry.address.clone(), count);
            }
            Err(e) => debug!("No flow count for {}: {:#}", entry.address, e),
        }
    }
    Some(flows)
}

fn render_entries(
    entries: &[BlockedAddress],
    live: Option<&HashSet<String>>,
    flows: Option<&HashMap<String, usize>>,
    now: DateTime<Utc>,
) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let remaining = if entry.is_active(now) {
                format!("{}m left", (entry.blocked_until - now).num_minutes())
            } else {
                "expired".to_string()
            };
            let kernel = match live {
                Some(live) if live.contains(&entry.address) => " [in firewall]",
                Some(_) => " [MISSING from firewall]",
                None => "",
            };
            let tracked = match flows.and_then(|f| f.get(&entry.address)) {
                Some(n) => format!(" ({} tracked flow(s))", n),
                None => String::new(),
            };
            format!(
                "  {:<40} {:<24} {}{}{}",
                entry.address, entry.username, remaining, kernel, tracked
            )
        })
        .collect()
}
