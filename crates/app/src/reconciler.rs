use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::watch,
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{error, info, warn};

use outreach_util::OrphanConfig;

use crate::aggregator::Clock;
use crate::orphan::{OrphanQueue, ReconcileReport};

/// Background worker that retries parked events and dead-letters stale ones.
#[derive(Clone)]
pub struct OrphanReconciler {
    queue: OrphanQueue,
    clock: Clock,
    interval: Duration,
    batch_timeout: Duration,
}

/// What one cycle achieved. `None` marks a phase that failed or timed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub reconciled: Option<ReconcileReport>,
    pub dead_lettered: Option<usize>,
}

impl OrphanReconciler {
    pub fn new(queue: OrphanQueue, config: &OrphanConfig) -> Self {
        Self {
            queue,
            clock: Arc::new(Utc::now),
            interval: config.sweep_interval,
            batch_timeout: config.batch_timeout,
        }
    }

    /// Overrides the clock used for expiry decisions.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the worker loop until `shutdown` flips to `true` or its sender drops.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop(shutdown).await;
        })
    }

    async fn run_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(stage = "orphan", "orphan reconciler stopping");
                        return;
                    }
                    continue;
                }
            }

            // A cycle in progress always completes before shutdown is observed.
            self.run_once().await;
        }
    }

    /// Executes one reconcile pass followed by one expiry sweep.
    pub async fn run_once(&self) -> CycleReport {
        let now = (self.clock)();

        let reconciled = match timeout(self.batch_timeout, self.queue.reconcile_pending(now)).await {
            Ok(Ok(report)) => {
                info!(
                    stage = "orphan",
                    examined = report.examined,
                    replayed = report.replayed,
                    still_pending = report.still_pending,
                    failed = report.failed,
                    "orphan reconcile completed"
                );
                Some(report)
            }
            Ok(Err(err)) => {
                error!(stage = "orphan", error = %err, "orphan reconcile failed");
                None
            }
            Err(_) => {
                warn!(
                    stage = "orphan",
                    timeout_ms = self.batch_timeout.as_millis() as u64,
                    "orphan reconcile timed out"
                );
                None
            }
        };

        let dead_lettered = match timeout(self.batch_timeout, self.queue.sweep_expired(now)).await {
            Ok(Ok(dead_letters)) => {
                info!(
                    stage = "orphan",
                    dead_lettered = dead_letters.len(),
                    threshold = %now.to_rfc3339(),
                    "orphan expiry sweep completed"
                );
                Some(dead_letters.len())
            }
            Ok(Err(err)) => {
                error!(stage = "orphan", error = %err, "orphan expiry sweep failed");
                None
            }
            Err(_) => {
                warn!(
                    stage = "orphan",
                    timeout_ms = self.batch_timeout.as_millis() as u64,
                    "orphan expiry sweep timed out"
                );
                None
            }
        };

        CycleReport {
            reconciled,
            dead_lettered,
        }
    }
}
