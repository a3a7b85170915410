use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{create_backend, BackendKind, FirewallBackend};
use crate::cmd_abstraction::CommandExecutor;
use crate::error::TblockerError;

/// Owns the one backend chosen at startup and forwards every operation to it.
pub struct FirewallManager {
    backend: Box<dyn FirewallBackend>,
}

impl FirewallManager {
    /// Select a backend by configured name, falling back to whatever is
    /// available, and initialize it.
    ///
    /// Unknown names log a warning and select [`BackendKind::DEFAULT`].
    pub async fn new(name: &str, executor: Arc<dyn CommandExecutor>) -> Result<Self> {
        let requested = match BackendKind::from_name(name) {
            Some(kind) => kind,
            None => {
                warn!(
                    "Unknown firewall backend '{}', using {}",
                    name,
                    BackendKind::DEFAULT
                );
                BackendKind::DEFAULT
            }
        };

        let alternatives = BackendKind::FALLBACK_ORDER
            .iter()
            .filter(|kind| **kind != requested)
            .map(|kind| create_backend(*kind, executor.clone()))
            .collect();

        Self::with_backends(create_backend(requested, executor), alternatives).await
    }

    /// Use `requested` if available, else the first available alternative.
    pub async fn with_backends(
        requested: Box<dyn FirewallBackend>,
        alternatives: Vec<Box<dyn FirewallBackend>>,
    ) -> Result<Self> {
        let mut tried = vec![requested.name()];

        let backend = if requested.is_available().await {
            requested
        } else {
            let mut chosen = None;
            for candidate in alternatives {
                tried.push(candidate.name());
                if candidate.is_available().await {
                    warn!(
                        "Firewall backend {} is not available, falling back to {}",
                        requested.name(),
                        candidate.name()
                    );
                    chosen = Some(candidate);
                    break;
                }
            }
            match chosen {
                Some(backend) => backend,
                None => {
                    return Err(TblockerError::BackendNotAvailable(tried.join(", ")).into());
                }
            }
        };

        backend.initialize().await?;
        info!("Using {} firewall backend", backend.name());

        Ok(Self { backend })
    }

    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn block(&self, ip: &str) -> Result<()> {
        self.backend.block_ip(ip).await
    }

    pub async fn unblock(&self, ip: &str) -> Result<()> {
        self.backend.unblock_ip(ip).await
    }

    pub async fn blocked_ips(&self) -> Result<HashSet<String>> {
        self.backend.blocked_ips().await
    }
}

/// Remove the managed state of every backend kind the host supports.
///
/// The daemon may have fallen back to a backend other than the configured
/// one, so cleanup does not trust the configuration. Returns the names of
/// the backends cleaned.
pub async fn teardown_all(executor: Arc<dyn CommandExecutor>) -> Result<Vec<&'static str>> {
    let backends = BackendKind::FALLBACK_ORDER
        .iter()
        .map(|kind| create_backend(*kind, executor.clone()))
        .collect();
    teardown_backends(backends).await
}

async fn teardown_backends(backends: Vec<Box<dyn FirewallBackend>>) -> Result<Vec<&'static str>> {
    let mut cleaned = Vec::new();
    let mut errors = Vec::new();

    for backend in backends {
        if !backend.is_available().await {
            debug!("{} not available, nothing to remove", backend.name());
            continue;
        }
        match backend.teardown().await {
            Ok(()) => cleaned.push(backend.name()),
            Err(e) => errors.push(format!("{}: {:#}", backend.name(), e)),
        }
    }

    if !errors.is_empty() {
        return Err(TblockerError::Firewall(errors.join("; ")).into());
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcer::mock::MemoryBackend;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_requested_backend_used_when_available() {
        let nft = Arc::new(MemoryBackend::new("nftables"));
        let ipt = Arc::new(MemoryBackend::new("iptables"));

        let manager = FirewallManager::with_backends(
            Box::new(nft.clone()),
            vec![Box::new(ipt.clone())],
        )
        .await
        .unwrap();

        assert_eq!(manager.name(), "nftables");
        assert_eq!(nft.initialized.load(Ordering::SeqCst), 1);
        assert_eq!(ipt.initialized.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_falls_back_when_requested_unavailable() {
        let nft = Arc::new(MemoryBackend::unavailable("nftables"));
        let ipt = Arc::new(MemoryBackend::new("iptables"));

        let manager = FirewallManager::with_backends(
            Box::new(nft.clone()),
            vec![Box::new(ipt.clone())],
        )
        .await
        .unwrap();

        assert_eq!(manager.name(), "iptables");
        manager.block("10.0.0.5").await.unwrap();
        assert!(ipt.contains("10.0.0.5"));
        assert!(!nft.contains("10.0.0.5"));
    }

    #[tokio::test]
    async fn test_no_backend_available() {
        let err = FirewallManager::with_backends(
            Box::new(MemoryBackend::unavailable("nftables")),
            vec![Box::new(MemoryBackend::unavailable("iptables"))],
        )
        .await
        .err()
        .unwrap();

        match err.downcast_ref::<TblockerError>() {
            Some(TblockerError::BackendNotAvailable(tried)) => {
                assert_eq!(tried, "nftables, iptables");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_operations_delegate() {
        let backend = Arc::new(MemoryBackend::new("iptables"));
        let manager = FirewallManager::with_backends(Box::new(backend.clone()), vec![])
            .await
            .unwrap();

        manager.block("10.0.0.5").await.unwrap();
        manager.block("10.0.0.6").await.unwrap();
        manager.unblock("10.0.0.6").await.unwrap();
        // Absent address.
        manager.unblock("10.0.0.7").await.unwrap();

        let blocked = manager.blocked_ips().await.unwrap();
        assert_eq!(blocked, HashSet::from(["10.0.0.5".to_string()]));

    }

    #[tokio::test]
    async fn test_teardown_backends_skips_unavailable() {
        let ipt = Arc::new(MemoryBackend::new("iptables"));
        let nft = Arc::new(MemoryBackend::unavailable("nftables"));
        ipt.insert("10.0.0.5");
        nft.insert("10.0.0.6");

        let backends: Vec<Box<dyn FirewallBackend>> =
            vec![Box::new(ipt.clone()), Box::new(nft.clone())];
        let cleaned = teardown_backends(backends).await.unwrap();

        assert_eq!(cleaned, vec!["iptables"]);
        assert!(!ipt.contains("10.0.0.5"));
        assert!(nft.contains("10.0.0.6"));
    }

    #[tokio::test]
    async fn test_unknown_name_uses_default() {
        use crate::cmd_abstraction::{CommandOutput, MockCommandExecutor};

        // Every command succeeds with empty output, which is enough for the
        // iptables availability check and setup to go through.
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute().returning(|cmd, _| {
            assert!(cmd == "iptables" || cmd == "ip6tables", "unexpected {}", cmd);
            Ok(CommandOutput {
                success: true,
                code: Some(0),
                ..Default::default()
            })
        });

        let manager = FirewallManager::new("pf", Arc::new(mock)).await.unwrap();
        assert_eq!(manager.name(), BackendKind::DEFAULT.as_str());
    }
}
