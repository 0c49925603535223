use std::{
    collections::BTreeSet,
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use harvest_model::{AgentHandle, AgentId, JobInstanceId};
use tokio::{sync::Mutex, task::JoinHandle, time::timeout};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use super::{EngineJob, EngineOutcome, ExecutionEngine, JobContext, SchedulerApi};
use crate::{
    clock::Clock,
    config::CoordinatorConfig,
    error::{HarvestError, Result},
    jobs::{FailureOutcome, FailureSink, FailureSource, PermanentFailure},
    registry::AgentRegistry,
    schedule::{LoopSchedule, spawn_periodic},
};

/// What one fetch cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchCycleReport {
    /// Another cycle was still running; this one did nothing.
    pub skipped: bool,
    pub candidates: usize,
    /// Not runnable here (controller or engine capability).
    pub filtered: usize,
    pub claimed: usize,
    /// Claim lost to another worker.
    pub lost_races: usize,
    pub submitted: usize,
    /// Claimed but refused by the engine, then unclaimed.
    pub rejected: usize,
    pub errors: usize,
    pub at_capacity: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub registry_refreshed: bool,
    pub in_flight: usize,
    /// In-flight jobs the store still attributes to this worker.
    pub jobs_refreshed: u64,
}

/// Join handles of the coordinator's two loops.
#[derive(Debug)]
pub struct CoordinatorHandles {
    pub fetch: JoinHandle<()>,
    pub heartbeat: JoinHandle<()>,
}

impl CoordinatorHandles {
    pub async fn join(self) {
        for (name, handle) in [("fetch", self.fetch), ("heartbeat", self.heartbeat)] {
            if let Err(err) = handle.await {
                error!(task = name, error = %err, "coordinator loop panicked");
            }
        }
    }
}

/// Resets the non-reentrancy flag when a fetch cycle ends, however it ends.
struct FetchGuard<'a>(&'a AtomicBool);

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Worker loop that claims jobs from the scheduler and feeds them to the
/// local execution engine.
///
/// Fetch and heartbeat run as separate loops with their own cancellation
/// tokens. They only share state through the scheduler, the registry and
/// the in-flight set.
pub struct JobClaimCoordinator {
    handle: AgentHandle,
    scheduler: Arc<dyn SchedulerApi>,
    registry: AgentRegistry,
    engine: Arc<dyn ExecutionEngine>,
    sink: Arc<dyn FailureSink>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    fetching: AtomicBool,
    in_flight: Arc<Mutex<BTreeSet<JobInstanceId>>>,
    watchers: TaskTracker,
    fetch_token: CancellationToken,
    heartbeat_token: CancellationToken,
}

impl fmt::Debug for JobClaimCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self
            .in_flight
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("JobClaimCoordinator")
            .field("worker", &self.handle.agent_id)
            .field("scheduler", &self.scheduler)
            .field("engine", &self.engine)
            .field("config", &self.config)
            .field("in_flight", &in_flight)
            .field("fetch_cancelled", &self.fetch_token.is_cancelled())
            .field("heartbeat_cancelled", &self.heartbeat_token.is_cancelled())
            .finish()
    }
}

impl JobClaimCoordinator {
    pub fn new(
        handle: AgentHandle,
        scheduler: Arc<dyn SchedulerApi>,
        registry: AgentRegistry,
        engine: Arc<dyn ExecutionEngine>,
        sink: Arc<dyn FailureSink>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            handle,
            scheduler,
            registry,
            engine,
            sink,
            clock,
            config,
            fetching: AtomicBool::new(false),
            in_flight: Arc::new(Mutex::new(BTreeSet::new())),
            watchers: TaskTracker::new(),
            fetch_token: CancellationToken::new(),
            heartbeat_token: CancellationToken::new(),
        }
    }

    pub fn worker_id(&self) -> &AgentId {
        &self.handle.agent_id
    }

    pub async fn in_flight(&self) -> Vec<JobInstanceId> {
        self.in_flight.lock().await.iter().copied().collect()
    }

    async fn bounded<T, F>(&self, what: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout(self.config.call_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(HarvestError::Timeout(format!(
                "{what} exceeded {}ms",
                self.config.call_timeout_ms
            ))),
        }
    }

    /// Announces this worker in the registry.
    pub async fn register(&self) -> Result<()> {
        let handle = self.handle_with_telemetry();
        self.bounded("register agent", self.registry.register_agent(handle))
            .await
    }

    /// One poll of the scheduler. Never runs concurrently with itself.
    pub async fn fetch_and_run_jobs(&self) -> Result<FetchCycleReport> {
        if self.fetching.swap(true, Ordering::AcqRel) {
            debug!(target: "harvest::fetch", worker = %self.worker_id(), "previous fetch cycle still running");
            return Ok(FetchCycleReport {
                skipped: true,
                ..FetchCycleReport::default()
            });
        }
        let _guard = FetchGuard(&self.fetching);
        let mut report = FetchCycleReport::default();

        if !self.engine.can_accept_jobs() {
            report.at_capacity = true;
            return Ok(report);
        }

        let candidates = self
            .bounded(
                "get jobs to run",
                self.scheduler
                    .get_jobs_to_run(self.config.candidate_fetch_limit),
            )
            .await?;
        report.candidates = candidates.len();

        for job in candidates {
            if report.claimed >= self.config.max_new_jobs_in_one_cycle {
                break;
            }
            if !self.handle.can_run(&job.controller_name) {
                report.filtered += 1;
                continue;
            }
            let ctx = JobContext::new(job, self.worker_id().clone());
            if !self.engine.can_run_job(&ctx) {
                report.filtered += 1;
                continue;
            }
            if !self.engine.can_accept_jobs() {
                report.at_capacity = true;
                break;
            }

            let instance_id = ctx.instance_id();
            let claimed = self
                .bounded(
                    "claim job",
                    self.scheduler.claim_job(instance_id, self.worker_id()),
                )
                .await;
            match claimed {
                Ok(true) => report.claimed += 1,
                Ok(false) => {
                    report.lost_races += 1;
                    debug!(target: "harvest::fetch", instance = %instance_id, "claim lost to another worker");
                    continue;
                }
                Err(err) => {
                    report.errors += 1;
                    warn!(target: "harvest::fetch", instance = %instance_id, error = %err, "claim failed");
                    continue;
                }
            }

            match self.engine.submit_job(ctx) {
                Some(engine_job) => {
                    report.submitted += 1;
                    self.in_flight.lock().await.insert(instance_id);
                    self.watch(engine_job);
                    debug!(target: "harvest::fetch", worker = %self.worker_id(), instance = %instance_id, "job submitted");
                }
                None => {
                    report.rejected += 1;
                    self.release_rejected(instance_id).await;
                }
            }
        }

        if report.claimed > 0 || report.errors > 0 {
            info!(
                target: "harvest::fetch",
                worker = %self.worker_id(),
                candidates = report.candidates,
                claimed = report.claimed,
                submitted = report.submitted,
                lost_races = report.lost_races,
                rejected = report.rejected,
                "fetch cycle finished"
            );
        }
        Ok(report)
    }

    async fn release_rejected(&self, instance_id: JobInstanceId) {
        let released = self
            .bounded(
                "unclaim job",
                self.scheduler.unclaim_job(instance_id, self.worker_id()),
            )
            .await;
        match released {
            Ok(true) => {
                debug!(target: "harvest::fetch", instance = %instance_id, "engine refused job; unclaimed")
            }
            Ok(false) => {
                warn!(target: "harvest::fetch", instance = %instance_id, "engine refused job but it was no longer ours")
            }
            // The sweeper requeues it once the claim heartbeat goes stale.
            Err(err) => {
                warn!(target: "harvest::fetch", instance = %instance_id, error = %err, "unclaim after refusal failed")
            }
        }
    }

    fn watch(&self, engine_job: EngineJob) {
        let scheduler = Arc::clone(&self.scheduler);
        let sink = Arc::clone(&self.sink);
        let clock = Arc::clone(&self.clock);
        let in_flight = Arc::clone(&self.in_flight);
        let worker = self.worker_id().clone();
        let call_timeout = self.config.call_timeout();

        self.watchers.spawn(async move {
            let instance_id = engine_job.instance_id;
            let outcome = engine_job.wait().await;
            in_flight.lock().await.remove(&instance_id);

            match outcome {
                EngineOutcome::Success => {
                    match timeout(call_timeout, scheduler.complete_job(instance_id, &worker)).await {
                        Ok(Ok(true)) => {
                            info!(target: "harvest::fetch", instance = %instance_id, "job completed")
                        }
                        Ok(Ok(false)) => {
                            warn!(target: "harvest::fetch", instance = %instance_id, "job finished after ownership was lost")
                        }
                        Ok(Err(err)) => {
                            warn!(target: "harvest::fetch", instance = %instance_id, error = %err, "recording completion failed")
                        }
                        Err(_) => {
                            warn!(target: "harvest::fetch", instance = %instance_id, "recording completion timed out")
                        }
                    }
                }
                EngineOutcome::Failure(reason) => {
                    let recorded = timeout(
                        call_timeout,
                        scheduler.fail_job(instance_id, &worker, Some(reason.clone())),
                    )
                    .await;
                    match recorded {
                        Ok(Ok(Some(FailureOutcome::Requeued(job)))) => {
                            warn!(
                                target: "harvest::fetch",
                                instance = %instance_id,
                                attempt = job.attempt_count,
                                attempt_max = job.attempt_max,
                                reason = %reason,
                                "job failed; requeued"
                            )
                        }
                        Ok(Ok(Some(FailureOutcome::Exhausted(job)))) => {
                            sink.report(PermanentFailure::from_instance(
                                &job,
                                FailureSource::Execution,
                                clock.now(),
                            ))
                            .await;
                        }
                        Ok(Ok(None)) => {
                            warn!(target: "harvest::fetch", instance = %instance_id, "job failed after ownership was lost")
                        }
                        Ok(Err(err)) => {
                            warn!(target: "harvest::fetch", instance = %instance_id, error = %err, "recording failure failed")
                        }
                        Err(_) => {
                            warn!(target: "harvest::fetch", instance = %instance_id, "recording failure timed out")
                        }
                    }
                }
            }
        });
    }

    fn handle_with_telemetry(&self) -> AgentHandle {
        let mut handle = self.handle.clone();
        handle.telemetry.extend(self.engine.telemetry());
        handle
    }

    /// Refreshes registry liveness and the heartbeat of every in-flight job.
    /// A registry failure does not stop the job heartbeat.
    pub async fn heartbeat_once(&self) -> Result<HeartbeatReport> {
        self.engine.record_heartbeat_for_all_threads();
        let mut report = HeartbeatReport::default();

        let handle = self.handle_with_telemetry();
        match self
            .bounded(
                "refresh agent heartbeat",
                self.registry.refresh_heartbeat_and_telemetry(handle),
            )
            .await
        {
            Ok(()) => report.registry_refreshed = true,
            Err(err) => {
                warn!(target: "harvest::heartbeat", worker = %self.worker_id(), error = %err, "registry heartbeat failed")
            }
        }

        let ids = self.in_flight().await;
        report.in_flight = ids.len();
        if !ids.is_empty() {
            report.jobs_refreshed = self
                .bounded(
                    "heartbeat jobs",
                    self.scheduler.heartbeat_jobs(&ids, self.worker_id()),
                )
                .await?;
            if report.jobs_refreshed < ids.len() as u64 {
                warn!(
                    target: "harvest::heartbeat",
                    worker = %self.worker_id(),
                    in_flight = ids.len(),
                    refreshed = report.jobs_refreshed,
                    "some in-flight jobs are no longer owned by this worker"
                );
            }
        }
        debug!(target: "harvest::heartbeat", worker = %self.worker_id(), in_flight = report.in_flight, "heartbeat");
        Ok(report)
    }

    /// Starts the fetch and heartbeat loops.
    pub fn start(self: &Arc<Self>) -> CoordinatorHandles {
        let warmup = self.config.warmup_delay();
        let jitter = std::time::Duration::from_millis(self.config.start_jitter_ms);

        let coordinator = Arc::clone(self);
        let fetch = spawn_periodic(
            "fetch",
            LoopSchedule::every(self.config.fetch_interval()).with_warmup(warmup, jitter),
            self.fetch_token.clone(),
            move || {
                let coordinator = Arc::clone(&coordinator);
                async move {
                    if let Err(err) = coordinator.fetch_and_run_jobs().await {
                        if err.is_transient() {
                            warn!(target: "harvest::fetch", error = %err, "fetch cycle failed");
                        } else {
                            error!(target: "harvest::fetch", error = %err, "fetch cycle failed");
                        }
                    }
                }
            },
        );

        let coordinator = Arc::clone(self);
        let heartbeat = spawn_periodic(
            "heartbeat",
            LoopSchedule::every(self.config.heartbeat_interval()),
            self.heartbeat_token.clone(),
            move || {
                let coordinator = Arc::clone(&coordinator);
                async move {
                    if let Err(err) = coordinator.heartbeat_once().await {
                        warn!(target: "harvest::heartbeat", error = %err, "heartbeat cycle failed");
                    }
                }
            },
        );

        CoordinatorHandles { fetch, heartbeat }
    }

    pub fn stop_fetching(&self) {
        self.fetch_token.cancel();
    }

    pub fn stop_heartbeat(&self) {
        self.heartbeat_token.cancel();
    }

    /// Stops fetching, hands in-flight jobs back to the scheduler when
    /// configured to, then stops heartbeating. Returns how many jobs were
    /// unclaimed. Jobs that cannot be unclaimed are left to the sweeper.
    pub async fn shutdown(&self) -> usize {
        self.stop_fetching();
        self.watchers.close();

        let mut unclaimed = 0;
        if self.config.unclaim_on_shutdown {
            for instance_id in self.in_flight().await {
                let released = self
                    .bounded(
                        "unclaim job",
                        self.scheduler.unclaim_job(instance_id, self.worker_id()),
                    )
                    .await;
                match released {
                    Ok(true) => unclaimed += 1,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(instance = %instance_id, error = %err, "unclaim on shutdown failed")
                    }
                }
            }
        }

        self.stop_heartbeat();
        info!(worker = %self.worker_id(), unclaimed, "coordinator shut down");
        unclaimed
    }

    /// Waits for completion watchers of already-submitted jobs.
    pub async fn drain(&self) {
        self.watchers.close();
        self.watchers.wait().await;
    }
}
