//! Shutdown coordination.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::resilience::timeouts::with_deadline;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal. Later calls are no-ops.
    pub fn trigger(&self, reason: &str) {
        if self.triggered.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(reason = %reason, subscribers = self.tx.receiver_count(), "Shutdown triggered");
        let _ = self.tx.send(());
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Wait for `work` to drain, giving up after `deadline`. True if it finished.
    pub async fn drain<F: Future>(&self, deadline: Duration, work: F) -> bool {
        match with_deadline(deadline, work).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Shutdown drain deadline exceeded, forcing exit");
                false
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve once the shutdown signal fires (or its sender is gone).
pub async fn wait(mut rx: broadcast::Receiver<()>) {
    let _ = rx.recv().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_reaches_every_subscriber_once() {
        let shutdown = Shutdown::new();
        let a = shutdown.subscribe();
        let mut b = shutdown.subscribe();

        shutdown.trigger("test");
        shutdown.trigger("again");
        assert!(shutdown.is_triggered());
        wait(a).await;
        assert!(b.recv().await.is_ok());
        assert!(b.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_after_deadline() {
        let shutdown = Shutdown::new();
        assert!(shutdown.drain(Duration::from_secs(1), async {}).await);
        let stuck = shutdown
            .drain(Duration::from_secs(1), std::future::pending::<()>())
            .await;
        assert!(!stuck);
    }
}
