//! Drift repair between the store and the live packet filter.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::enforcer::parse_ip;
use crate::orchestrator::Orchestrator;

/// Periodically re-blocks every active store entry missing from the
/// kernel. The store is never modified here; kernel state is moved toward
/// it, never the reverse.
pub struct Reconciler {
    orchestrator: Arc<Orchestrator>,
    period: Duration,
}

impl Reconciler {
    pub fn new(orchestrator: Arc<Orchestrator>, period: Duration) -> Self {
        Self {
            orchestrator,
            period,
        }
    }

    /// One pass. Returns the addresses that were re-blocked.
    pub async fn run_once(&self) -> Result<Vec<String>> {
        let live: HashSet<String> = self
            .orchestrator
            .firewall()
            .blocked_ips()
            .await?
            .iter()
            .map(|addr| canonical(addr))
            .collect();

        let store = self.orchestrator.store();
        let missing: Vec<String> = store
            .active(store.now())
            .into_iter()
            .map(|entry| entry.address)
            .filter(|address| !live.contains(&canonical(address)))
            .collect();

        if missing.is_empty() {
            debug!("Reconciliation: firewall matches the store");
            return Ok(Vec::new());
        }

        warn!(
            "Reconciliation: {} stored address(es) missing from the firewall",
            missing.len()
        );

        let mut restored = Vec::new();
        for address in missing {
            match self.orchestrator.enforce(&address).await {
                Ok(()) => {
                    info!("Reconciliation: re-blocked {}", address);
                    restored.push(address);
                }
                Err(e) => error!("Reconciliation: failed to re-block {}: {:#}", address, e),
            }
        }
        Ok(restored)
    }

    /// First pass immediately, then one per period.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once().await {
                error!("Reconciliation failed: {:#}", e);
            }
        }
    }
}

fn canonical(address: &str) -> String {
    parse_ip(address)
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| address.to_string())
}
