//! Reconcile trigger loop
//!
//! Desired sets may arrive in bursts while the configuration source
//! settles. The loop keeps only the latest one and applies it on the next
//! coalescing tick, so passes never overlap and intermediate sets are
//! never applied.

use super::Reconciler;
use crate::diff::DesiredSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Default coalescing interval
pub const DEFAULT_COALESCE_INTERVAL: Duration = Duration::from_secs(2);

const CHANNEL_CAPACITY: usize = 16;

/// Applies desired sets received on a channel, latest first
pub struct ReconcileLoop {
    reconciler: Arc<Reconciler>,
    interval: Duration,
    desired_rx: mpsc::Receiver<DesiredSet>,
}

impl ReconcileLoop {
    /// Create the loop and the sender configuration sources push desired sets to
    pub fn new(reconciler: Arc<Reconciler>, interval: Duration) -> (Self, mpsc::Sender<DesiredSet>) {
        let (desired_tx, desired_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let loop_instance = Self {
            reconciler,
            interval,
            desired_rx,
        };

        (loop_instance, desired_tx)
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.interval.as_millis(),
            "Starting reconcile loop"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending: Option<DesiredSet> = None;
        let mut passes = 0u64;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!(passes = passes, "Shutting down reconcile loop");
                    break;
                }
                Some(desired) = self.desired_rx.recv() => {
                    if pending.replace(desired).is_some() {
                        debug!("Superseded pending desired set");
                    }
                }
                _ = ticker.tick() => {
                    let Some(desired) = pending.take() else {
                        continue;
                    };
                    let report = self.reconciler.reconcile(desired).await;
                    passes += 1;
                    debug!(
                        pass = passes,
                        operations = report.operations.len(),
                        errors = report.errors.len(),
                        "Applied desired set"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthRegistry;
    use crate::observability::StructuredLogger;
    use crate::reconcile::ReconcilerConfig;
    use crate::supervisor::ExecutorConfig;
    use crate::testing::MockInput;
    use serde_json::json;

    fn reconciler() -> Arc<Reconciler> {
        let config = ReconcilerConfig {
            executor: ExecutorConfig {
                max_jitter: Duration::ZERO,
                max_crashes: 6,
            },
            ..ReconcilerConfig::default()
        };
        Arc::new(
            Reconciler::builder()
                .config(config)
                .health(HealthRegistry::new())
                .logger(StructuredLogger::new("test-node"))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_latest_pending_set_is_applied() {
        let reconciler = reconciler();
        let (reconcile_loop, desired_tx) =
            ReconcileLoop::new(Arc::clone(&reconciler), Duration::from_secs(2));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let stale = MockInput::new(json!({ "host": "old" }));
        let stale_counters = stale.counters();
        desired_tx
            .send(DesiredSet::new().with("mysql", stale, "confd"))
            .await
            .unwrap();
        desired_tx
            .send(DesiredSet::new().with("redis", MockInput::new(json!({})), "confd"))
            .await
            .unwrap();

        let handle = tokio::spawn(reconcile_loop.run(shutdown_rx));
        tokio::time::sleep(Duration::from_secs(3)).await;

        {
            let instances = reconciler.registry().read().await;
            assert_eq!(instances.kinds(), vec!["redis"]);
        }
        assert_eq!(stale_counters.runs(), 0);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_set_applied_on_next_tick() {
        let reconciler = reconciler();
        let (reconcile_loop, desired_tx) =
            ReconcileLoop::new(Arc::clone(&reconciler), Duration::from_secs(2));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(reconcile_loop.run(shutdown_rx));

        desired_tx
            .send(DesiredSet::new().with("cpu", MockInput::new(json!({})), "confd"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(reconciler.registry().read().await.len("cpu"), 1);

        desired_tx
            .send(DesiredSet::new().with("mem", MockInput::new(json!({})), "confd"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        {
            let instances = reconciler.registry().read().await;
            assert_eq!(instances.len("cpu"), 0);
            assert_eq!(instances.len("mem"), 1);
        }

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
