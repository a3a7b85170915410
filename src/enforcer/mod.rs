//! Packet-filter backends (iptables rule chain, nftables address set).

mod iptables;
mod manager;
mod nftables;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

pub use iptables::IptablesBackend;
pub use manager::{teardown_all, FirewallManager};
pub use nftables::NftablesBackend;

use crate::cmd_abstraction::CommandExecutor;
use crate::error::TblockerError;

/// Concrete packet-filter mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Dedicated chain in the raw table, one DROP rule per address
    Iptables,
    /// Dedicated inet table with address sets matched by a single rule
    Nftables,
}

impl BackendKind {
    /// Used when the configured name is not recognised.
    pub const DEFAULT: BackendKind = BackendKind::Iptables;

    /// Order tried when the requested backend is unavailable.
    pub const FALLBACK_ORDER: [BackendKind; 2] = [BackendKind::Iptables, BackendKind::Nftables];

    /// Resolve a configured backend name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "iptables" => Some(BackendKind::Iptables),
            "nft" | "nftables" => Some(BackendKind::Nftables),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Iptables => "iptables",
            BackendKind::Nftables => "nftables",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Driver for one kernel packet-filter mechanism.
///
/// Implementations must be idempotent: `initialize` detects state it
/// created earlier, `block_ip` never installs a second drop for the same
/// address, and `unblock_ip` succeeds when nothing is installed.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    /// Create the managed chain/table/set if absent.
    async fn initialize(&self) -> Result<()>;

    /// Drop all traffic whose source is `ip`.
    async fn block_ip(&self, ip: &str) -> Result<()>;

    /// Remove the drop for `ip`. Absent rules are not an error.
    async fn unblock_ip(&self, ip: &str) -> Result<()>;

    /// Addresses currently dropped according to the live kernel state.
    async fn blocked_ips(&self) -> Result<HashSet<String>>;

    /// Whether the underlying mechanism is reachable on this host.
    async fn is_available(&self) -> bool;

    /// Remove everything this backend installed.
    async fn teardown(&self) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Build the backend for `kind`, sharing one executor.
pub fn create_backend(
    kind: BackendKind,
    executor: Arc<dyn CommandExecutor>,
) -> Box<dyn FirewallBackend> {
    match kind {
        BackendKind::Iptables => Box::new(IptablesBackend::new(executor)),
        BackendKind::Nftables => Box::new(NftablesBackend::new(executor)),
    }
}

/// Parse an address at the backend boundary.
pub fn parse_ip(ip: &str) -> Result<IpAddr> {
    ip.trim()
        .parse()
        .map_err(|_| TblockerError::InvalidIp(ip.to_string()).into())
}

/// Check if running as root (effective UID == 0).
///
/// CAP_NET_ADMIN would be enough in theory, but the external tools are
/// normally run as root and the UID check covers the sudo case.
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        return Err(TblockerError::Permission(
            "managing packet-filter rules requires root (or CAP_NET_ADMIN)".to_string(),
        )
        .into());
    }
    Ok(())
}
