//! Cleanup command: remove every kernel object tblocker installed.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::cmd_abstraction::RealCommandExecutor;
use crate::config::Config;
use crate::enforcer::{check_root, teardown_all};
use crate::lock::LockGuard;

/// Run the cleanup command
pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    check_root()?;

    // Refuses while the daemon holds the lock; it would re-create everything.
    let _lock = LockGuard::acquire(&config.lock_path())?;

    let cleaned = teardown_all(Arc::new(RealCommandExecutor::new())).await?;
    info!("Firewall state removed for: {}", cleaned.join(", "));

    println!();
    if cleaned.is_empty() {
        println!("No packet-filter backend available, nothing removed");
    } else {
        println!("Removed tblocker rules from: {}", cleaned.join(", "));
    }
    println!("Stored blocks are kept and re-applied on the next start.");
    println!();
    Ok(())
}
