//! Block lifecycle: store, kernel block, connection eviction, timers and
//! notifications.

use anyhow::Result;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::conntrack::ConntrackController;
use crate::enforcer::{parse_ip, FirewallManager};
use crate::error::TblockerError;
use crate::notify::{Action, Notification, Notifier};
use crate::reconcile::Reconciler;
use crate::scheduler::UnblockScheduler;
use crate::store::BlockStore;
use crate::watcher::Violation;

/// Tunables taken from the configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub block_duration_minutes: u64,
    pub bypass: Vec<IpNet>,
    pub sweep_interval: Duration,
}

impl Settings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            block_duration_minutes: config.block_duration,
            bypass: config.bypass_networks()?,
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
        })
    }

    /// Saturates instead of wrapping; the store rejects deadlines out of range.
    fn block_duration(&self) -> chrono::Duration {
        let minutes = i64::try_from(self.block_duration_minutes).unwrap_or(i64::MAX);
        chrono::Duration::try_minutes(minutes).unwrap_or(chrono::Duration::MAX)
    }

    /// Reconciliation runs once per block duration.
    pub fn reconcile_period(&self) -> Duration {
        Duration::from_secs(self.block_duration_minutes.saturating_mul(60))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Blocked,
    AlreadyBlocked,
    Bypassed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnblockOutcome {
    Unblocked,
    /// Deadline not reached yet
    StillActive,
    /// Nothing recorded for the address
    NotFound,
}

pub struct Orchestrator {
    store: Arc<BlockStore>,
    firewall: Arc<FirewallManager>,
    conntrack: Option<Arc<ConntrackController>>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    scheduler: UnblockScheduler,
    expirations: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    settings: Settings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<BlockStore>,
        firewall: Arc<FirewallManager>,
        conntrack: Option<Arc<ConntrackController>>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        settings: Settings,
    ) -> Arc<Self> {
        let (scheduler, expirations) = UnblockScheduler::new(clock.clone());
        Arc::new(Self {
            store,
            firewall,
            conntrack,
            notifier,
            clock,
            scheduler,
            expirations: Mutex::new(Some(expirations)),
            settings,
        })
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn firewall(&self) -> &Arc<FirewallManager> {
        &self.firewall
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn is_bypassed(&self, addr: &IpAddr) -> bool {
        self.settings.bypass.iter().any(|net| net.contains(addr))
    }

    /// React to one detected violation.
    ///
    /// An address that is already blocked is left alone: its timer is
    /// neither extended nor restarted.
    pub async fn handle_violation(&self, violation: &Violation) -> Result<BlockOutcome> {
        let addr = parse_ip(&violation.address)?;
        let address = addr.to_string();

        if self.is_bypassed(&addr) {
            debug!("{} is in the bypass list, ignoring", address);
            return Ok(BlockOutcome::Bypassed);
        }

        if self.store.is_blocked(&address) {
            info!(
                "User {} with IP {} is already blocked, skipping",
                violation.username, address
            );
            return Ok(BlockOutcome::AlreadyBlocked);
        }

        let duration = self.settings.block_duration();
        let deadline = match self.store.add(&address, &violation.username, duration) {
            Ok(entry) => entry.blocked_until,
            Err(e) if is_persistence(&e) => {
                // Memory already holds the entry; the next save catches up.
                error!("Failed to persist block of {}: {:#}", address, e);
                self.store
                    .get(&address)
                    .map(|entry| entry.blocked_until)
                    .unwrap_or_else(|| self.clock.now() + duration)
            }
            Err(e) => return Err(e),
        };

        self.scheduler.arm(&address, deadline);

        // A failed kernel block is retried by the next reconciliation pass.
        if let Err(e) = self.enforce(&address).await {
            error!("Error blocking IP {}: {:#}", address, e);
        }

        info!(
            "User {} with IP {} blocked for {} minutes",
            violation.username, address, self.settings.block_duration_minutes
        );
        self.spawn_notify(&violation.username, &address, Action::Block);

        Ok(BlockOutcome::Blocked)
    }

    /// Install the kernel block and evict tracked flows.
    ///
    /// Only the packet-filter step can fail; connection-tracking problems
    /// are logged.
    pub async fn enforce(&self, address: &str) -> Result<()> {
        self.firewall.block(address).await?;

        if let Some(conntrack) = self.conntrack.as_ref().filter(|c| c.is_available()) {
            if let Err(e) = conntrack.drop_connections(address).await {
                warn!("Failed to drop connections for IP {}: {:#}", address, e);
            }
        }
        Ok(())
    }

    /// Undo the block for `address` once its deadline has passed.
    ///
    /// The store entry is removed only after the kernel unblock succeeded,
    /// so a failure leaves it in place for the sweep to retry. If a new
    /// violation renewed the entry while the kernel call was in flight, the
    /// entry stays and the kernel block is put back.
    pub async fn unblock(&self, address: &str) -> Result<UnblockOutcome> {
        if self.store.is_blocked(address) {
            debug!("{} is still within its block period, not unblocking", address);
            return Ok(UnblockOutcome::StillActive);
        }

        let Some(entry) = self.store.get(address) else {
            debug!("{} is not in the store, nothing to unblock", address);
            return Ok(UnblockOutcome::NotFound);
        };

        if let Err(e) = self.firewall.unblock(address).await {
            error!("Error unblocking IP {}: {:#}", address, e);
            return Err(e);
        }

        match self.store.remove_if(address, entry.blocked_until) {
            Ok(true) => {}
            Ok(false) if self.store.is_blocked(address) => {
                info!("{} was blocked again while being unblocked, restoring", address);
                if let Err(e) = self.enforce(address).await {
                    error!("Error blocking IP {}: {:#}", address, e);
                }
                return Ok(UnblockOutcome::StillActive);
            }
            Ok(false) => {
                debug!("{} was already removed from the store", address);
                return Ok(UnblockOutcome::NotFound);
            }
            Err(e) => error!("Failed to persist removal of {}: {:#}", address, e),
        }

        info!("User {} with IP {} has been unblocked", entry.username, address);
        self.spawn_notify(&entry.username, address, Action::Unblock);

        Ok(UnblockOutcome::Unblocked)
    }

    /// Delivery runs detached; its outcome never reaches the caller.
    fn spawn_notify(&self, username: &str, address: &str, action: Action) {
        let notifier = self.notifier.clone();
        let notification = Notification {
            username: username.to_string(),
            address: address.to_string(),
            action,
            duration_minutes: self.settings.block_duration_minutes,
            timestamp: self.clock.now(),
        };
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&notification).await {
                warn!(
                    "Failed to send {} notification for {}: {:#}",
                    notification.action, notification.address, e
                );
            }
        });
    }

    /// Unblock every entry whose deadline passed. Safety net for lost
    /// timers and for unblocks that failed earlier.
    pub async fn sweep_expired(&self) -> usize {
        let mut unblocked = 0;
        for entry in self.store.expired(self.clock.now()) {
            match self.unblock(&entry.address).await {
                Ok(UnblockOutcome::Unblocked) => unblocked += 1,
                Ok(_) => {}
                Err(e) => warn!("Sweep could not unblock {}: {:#}", entry.address, e),
            }
        }
        if unblocked > 0 {
            info!("Sweep unblocked {} expired address(es)", unblocked);
        }
        unblocked
    }

    /// Start the background tasks: the unblock timer consumer, the periodic
    /// sweep and the reconciliation loop. Every stored entry gets its timer
    /// re-armed. Calling this twice is an error.
    pub fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let Some(mut expirations) = self
            .expirations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return Err(TblockerError::Config("orchestrator already started".to_string()).into());
        };

        let mut handles = Vec::new();

        let this = self.clone();
        handles.push(tokio::spawn(async move {
            while let Some(address) = expirations.recv().await {
                if let Err(e) = this.unblock(&address).await {
                    warn!("Timed unblock of {} failed: {:#}", address, e);
                }
            }
        }));

        let entries = self.store.list();
        if !entries.is_empty() {
            info!("Re-arming unblock timers for {} stored address(es)", entries.len());
        }
        for entry in entries {
            self.scheduler.arm(&entry.address, entry.blocked_until);
        }

        let this = self.clone();
        let period = self.settings.sweep_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                this.sweep_expired().await;
            }
        }));

        let reconciler = Reconciler::new(self.clone(), self.settings.reconcile_period());
        handles.push(tokio::spawn(reconciler.run()));

        Ok(handles)
    }
}

fn is_persistence(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<TblockerError>(),
        Some(TblockerError::Persistence(_))
    )
}
