//! Per-address deferred unblock tasks.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::clock::Clock;

/// Parks one task per armed address until its deadline, then hands the
/// address to whoever holds the receiving end.
///
/// Armed tasks cannot be cancelled; the consumer must tolerate addresses
/// that were already unblocked by other means.
#[derive(Clone)]
pub struct UnblockScheduler {
    tx: mpsc::UnboundedSender<String>,
    clock: Arc<dyn Clock>,
}

impl UnblockScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, clock }, rx)
    }

    /// Fire `address` at `deadline`, or right away if it has passed.
    pub fn arm(&self, address: &str, deadline: DateTime<Utc>) {
        let delay = (deadline - self.clock.now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        debug!("Unblock of {} armed in {}s", address, delay.as_secs());

        let tx = self.tx.clone();
        let address = address.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the daemon is shutting down.
            let _ = tx.send(address);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_deadline() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (scheduler, mut rx) = UnblockScheduler::new(clock.clone());

        scheduler.arm("10.0.0.5", clock.now() + Duration::minutes(10));
        scheduler.arm("10.0.0.6", clock.now() + Duration::minutes(5));

        tokio::time::sleep(StdDuration::from_secs(299)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(StdDuration::from_secs(2)).await;
        assert_eq!(rx.recv().await.unwrap(), "10.0.0.6");

        assert_eq!(rx.recv().await.unwrap(), "10.0.0.5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_fires_immediately() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (scheduler, mut rx) = UnblockScheduler::new(clock.clone());

        scheduler.arm("10.0.0.5", clock.now() - Duration::hours(1));

        let fired = tokio::time::timeout(StdDuration::from_millis(1), rx.recv()).await;
        assert_eq!(fired.unwrap().unwrap(), "10.0.0.5");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cloned_scheduler_shares_channel() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (scheduler, mut rx) = UnblockScheduler::new(clock.clone());
        let other = scheduler.clone();

        other.arm("10.0.0.7", clock.now() + Duration::seconds(1));
        assert_eq!(rx.recv().await.unwrap(), "10.0.0.7");
    }
}
