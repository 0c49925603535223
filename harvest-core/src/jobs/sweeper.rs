use std::{fmt, sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    FailureOutcome, FailureSink, FailureSource, JobInstanceStore,
    PermanentFailure,
};
use crate::{
    clock::Clock,
    error::Result,
    schedule::{LoopSchedule, spawn_periodic},
};

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale: usize,
    pub requeued: usize,
    pub exhausted: usize,
    /// Heartbeat arrived between listing and requeue; left alone.
    pub skipped: usize,
    pub errors: usize,
}

/// Requeues pending jobs whose owner stopped heartbeating. This is the
/// backstop for workers that crash without unclaiming.
pub struct OrphanSweeper {
    store: Arc<dyn JobInstanceStore>,
    sink: Arc<dyn FailureSink>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl fmt::Debug for OrphanSweeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrphanSweeper")
            .field("store", &self.store)
            .field("sink", &self.sink)
            .field("interval", &self.interval)
            .finish()
    }
}

impl OrphanSweeper {
    pub fn new(
        store: Arc<dyn JobInstanceStore>,
        sink: Arc<dyn FailureSink>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            sink,
            clock,
            interval,
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let stale = self.store.list_stale(now).await?;
        let mut report = SweepReport {
            stale: stale.len(),
            ..SweepReport::default()
        };

        for job in stale {
            let outcome = self
                .store
                .requeue_orphan(job.instance_id, job.last_heartbeat, now)
                .await;
            match outcome {
                Ok(Some(FailureOutcome::Requeued(updated))) => {
                    report.requeued += 1;
                    warn!(
                        target: "harvest::sweeper",
                        instance = %job.instance_id,
                        worker = ?job.worker_id,
                        attempt = updated.attempt_count,
                        attempt_max = updated.attempt_max,
                        "orphaned job requeued"
                    );
                }
                Ok(Some(FailureOutcome::Exhausted(updated))) => {
                    report.exhausted += 1;
                    self.sink
                        .report(PermanentFailure::from_instance(
                            &updated,
                            FailureSource::Orphaned,
                            now,
                        ))
                        .await;
                }
                Ok(None) => {
                    report.skipped += 1;
                    debug!(
                        target: "harvest::sweeper",
                        instance = %job.instance_id,
                        "job heartbeated before requeue; skipping"
                    );
                }
                Err(err) => {
                    report.errors += 1;
                    warn!(
                        target: "harvest::sweeper",
                        instance = %job.instance_id,
                        error = %err,
                        "orphan requeue failed"
                    );
                }
            }
        }

        if report.stale > 0 {
            info!(
                target: "harvest::sweeper",
                stale = report.stale,
                requeued = report.requeued,
                exhausted = report.exhausted,
                skipped = report.skipped,
                "orphan sweep finished"
            );
        }
        Ok(report)
    }

    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let schedule = LoopSchedule::every(self.interval);
        spawn_periodic("orphan-sweeper", schedule, token, move || {
            let sweeper = Arc::clone(&self);
            async move {
                if let Err(err) = sweeper.sweep_once().await {
                    if err.is_transient() {
                        warn!(target: "harvest::sweeper", error = %err, "orphan sweep failed");
                    } else {
                        error!(target: "harvest::sweeper", error = %err, "orphan sweep failed");
                    }
                }
            }
        })
    }
}
