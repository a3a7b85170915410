//! Signal handling for graceful shutdown.

use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

/// Resolve once SIGINT or SIGTERM arrives.
///
/// If neither handler can be registered (restricted environments), this
/// never resolves and the process has to be killed.
pub async fn wait_for_shutdown() {
    let sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("Failed to register SIGINT handler: {}", e);
            None
        }
    };

    let sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            None
        }
    };

    match (sigint, sigterm) {
        (Some(mut int), Some(mut term)) => {
            tokio::select! {
                _ = int.recv() => info!("Received SIGINT, shutting down..."),
                _ = term.recv() => info!("Received SIGTERM, shutting down..."),
            }
        }
        (Some(mut int), None) => {
            int.recv().await;
            info!("Received SIGINT, shutting down...");
        }
        (None, Some(mut term)) => {
            term.recv().await;
            info!("Received SIGTERM, shutting down...");
        }
        (None, None) => {
            warn!("No signal handlers registered - graceful shutdown disabled");
            std::future::pending::<()>().await;
        }
    }
}
