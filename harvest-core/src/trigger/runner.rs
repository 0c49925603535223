use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use harvest_model::{DbTrigger, TriggerMetadata};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{TriggerActionService, TriggerStore, action::build_request};
use crate::{
    clock::Clock,
    config::JobsConfig,
    cursor::StrategyRegistry,
    error::Result,
    schedule::{LoopSchedule, spawn_periodic},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerRunReport {
    pub triggers: usize,
    pub jobs_created: usize,
    /// Triggers whose next window was empty.
    pub idle: usize,
    pub metadata_updates: usize,
    /// Triggers another runner advanced between our read and our write.
    pub contended: usize,
    pub failed: usize,
}

enum TriggerOutcome {
    Created,
    Idle { metadata_saved: bool },
    /// Another runner advanced the trigger first.
    Contended,
}

/// Periodically turns every active trigger's next scan window into a job.
///
/// Several workers may run this against the same store. A window is claimed
/// by a compare-and-swap of the trigger metadata from the state the runner
/// read, and only the winner enqueues the job. When the enqueue fails the
/// cursor is swapped back, so the same window is retried on the next run.
pub struct TriggerRunner {
    triggers: Arc<dyn TriggerStore>,
    actions: Arc<dyn TriggerActionService>,
    strategies: StrategyRegistry,
    jobs: JobsConfig,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl fmt::Debug for TriggerRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerRunner")
            .field("triggers", &self.triggers)
            .field("actions", &self.actions)
            .field("strategies", &self.strategies)
            .field("interval", &self.interval)
            .finish()
    }
}

impl TriggerRunner {
    pub fn new(
        triggers: Arc<dyn TriggerStore>,
        actions: Arc<dyn TriggerActionService>,
        strategies: StrategyRegistry,
        jobs: JobsConfig,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            triggers,
            actions,
            strategies,
            jobs,
            clock,
            interval,
        }
    }

    /// Evaluates every active trigger once. Only listing the triggers can
    /// fail the run; a failing trigger is logged and the rest still run.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<TriggerRunReport> {
        let triggers = self.triggers.list_active().await?;
        let mut report = TriggerRunReport {
            triggers: triggers.len(),
            ..TriggerRunReport::default()
        };

        for trigger in &triggers {
            match self.run_trigger(trigger, now).await {
                Ok(TriggerOutcome::Created) => {
                    report.jobs_created += 1;
                    report.metadata_updates += 1;
                }
                Ok(TriggerOutcome::Idle { metadata_saved }) => {
                    report.idle += 1;
                    report.metadata_updates += usize::from(metadata_saved);
                }
                Ok(TriggerOutcome::Contended) => report.contended += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        target: "harvest::trigger",
                        trigger = %trigger.id,
                        integration = %trigger.integration_key,
                        error = %err,
                        "trigger run failed"
                    );
                }
            }
        }

        if report.jobs_created > 0 || report.failed > 0 {
            info!(
                target: "harvest::trigger",
                triggers = report.triggers,
                jobs_created = report.jobs_created,
                failed = report.failed,
                "trigger run finished"
            );
        }
        Ok(report)
    }

    async fn run_trigger(
        &self,
        trigger: &DbTrigger,
        now: DateTime<Utc>,
    ) -> Result<TriggerOutcome> {
        let strategy = self.strategies.for_trigger(trigger);
        let decision = strategy.next_decision(trigger, now);
        let metadata_changed = decision.metadata_changed(&trigger.metadata);

        let Some(window) = decision.window else {
            let metadata_saved = metadata_changed
                && self
                    .actions
                    .update_trigger_metadata(trigger.id, &trigger.metadata, decision.metadata)
                    .await?;
            debug!(target: "harvest::trigger", trigger = %trigger.id, strategy = strategy.name(), "nothing to scan");
            return Ok(TriggerOutcome::Idle { metadata_saved });
        };

        // Claim the window by advancing the cursor from the state we read.
        // Whoever loses the swap enqueues nothing.
        let claimed = self
            .actions
            .update_trigger_metadata(trigger.id, &trigger.metadata, decision.metadata.clone())
            .await?;
        if !claimed {
            debug!(
                target: "harvest::trigger",
                trigger = %trigger.id,
                from = %window.from,
                to = %window.to,
                "window claimed by another runner"
            );
            return Ok(TriggerOutcome::Contended);
        }

        let request = build_request(trigger, &window, &self.jobs, now);
        let job = match self
            .actions
            .create_triggered_job(trigger, window.partial(), request)
            .await
        {
            Ok(job) => job,
            Err(err) => {
                self.release_window(trigger, decision.metadata).await;
                return Err(err);
            }
        };

        info!(
            target: "harvest::trigger",
            trigger = %trigger.id,
            strategy = strategy.name(),
            instance = %job.instance_id,
            scan_type = %window.tags.scan_type,
            partial = window.partial(),
            from = %window.from,
            to = %window.to,
            "scan job enqueued"
        );
        Ok(TriggerOutcome::Created)
    }

    /// Puts the cursor back after a failed enqueue so the same window is
    /// offered again on the next run.
    async fn release_window(&self, trigger: &DbTrigger, claimed: TriggerMetadata) {
        match self
            .actions
            .update_trigger_metadata(trigger.id, &claimed, trigger.metadata.clone())
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(
                target: "harvest::trigger",
                trigger = %trigger.id,
                "cursor moved again before it could be restored"
            ),
            Err(err) => error!(
                target: "harvest::trigger",
                trigger = %trigger.id,
                error = %err,
                "enqueue failed and cursor could not be restored; window skipped"
            ),
        }
    }

    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let schedule = LoopSchedule::every(self.interval);
        spawn_periodic("trigger-runner", schedule, token, move || {
            let runner = Arc::clone(&self);
            async move {
                let now = runner.clock.now();
                if let Err(err) = runner.run_once(now).await {
                    if err.is_transient() {
                        warn!(target: "harvest::trigger", error = %err, "trigger run failed");
                    } else {
                        error!(target: "harvest::trigger", error = %err, "trigger run failed");
                    }
                }
            }
        })
    }
}
