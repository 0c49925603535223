//! Worker-side claim coordination: poll the scheduler, admit work into the
//! local execution engine, keep claimed jobs alive and report outcomes.

mod engine;
mod scheduler;
mod worker;

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use harvest_model::{AgentId, JobInstance, JobInstanceId, ScanTags};
use tokio::sync::oneshot;

use crate::{error::Result, jobs::FailureOutcome};

pub use engine::{BoundedExecutionEngine, JobHandler};
pub use scheduler::StoreScheduler;
pub use worker::{
    CoordinatorHandles, FetchCycleReport, HeartbeatReport, JobClaimCoordinator,
};

/// Central scheduler as seen from a worker.
#[async_trait]
pub trait SchedulerApi: Send + Sync + fmt::Debug {
    /// Up to `limit` unowned jobs that are due, lowest priority value first.
    async fn get_jobs_to_run(&self, limit: usize) -> Result<Vec<JobInstance>>;

    /// `false` when another worker already owns the job.
    async fn claim_job(&self, id: JobInstanceId, worker: &AgentId) -> Result<bool>;

    /// Hands the job back to the queue without charging an attempt.
    async fn unclaim_job(&self, id: JobInstanceId, worker: &AgentId) -> Result<bool>;

    /// Refreshes the heartbeat of the listed jobs `worker` still owns and
    /// returns how many it touched.
    async fn heartbeat_jobs(
        &self,
        ids: &[JobInstanceId],
        worker: &AgentId,
    ) -> Result<u64>;

    async fn complete_job(&self, id: JobInstanceId, worker: &AgentId) -> Result<bool>;

    /// Records a failed attempt. `None` when `worker` no longer owns the job.
    async fn fail_job(
        &self,
        id: JobInstanceId,
        worker: &AgentId,
        error: Option<String>,
    ) -> Result<Option<FailureOutcome>>;

    /// Jobs currently owned by `worker`.
    async fn owned_jobs(&self, worker: &AgentId) -> Result<Vec<JobInstance>>;
}

/// What the engine sees of a claimed job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobContext {
    pub instance: JobInstance,
    pub worker_id: AgentId,
    /// Parsed from the job's tags when the job came from a trigger.
    pub scan: Option<ScanTags>,
}

impl JobContext {
    pub fn new(instance: JobInstance, worker_id: AgentId) -> Self {
        let scan = ScanTags::from_tags(&instance.tags).ok();
        Self {
            instance,
            worker_id,
            scan,
        }
    }

    pub fn instance_id(&self) -> JobInstanceId {
        self.instance.instance_id
    }

    pub fn controller_name(&self) -> &str {
        &self.instance.controller_name
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutcome {
    Success,
    Failure(String),
}

/// Handle to a job accepted by the engine; resolves when execution ends.
#[derive(Debug)]
pub struct EngineJob {
    pub instance_id: JobInstanceId,
    outcome: oneshot::Receiver<EngineOutcome>,
}

impl EngineJob {
    pub fn new(
        instance_id: JobInstanceId,
    ) -> (Self, oneshot::Sender<EngineOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                instance_id,
                outcome: rx,
            },
            tx,
        )
    }

    /// A dropped sender counts as a failed execution.
    pub async fn wait(self) -> EngineOutcome {
        self.outcome.await.unwrap_or_else(|_| {
            EngineOutcome::Failure("execution aborted before reporting".into())
        })
    }
}

/// Local executor that actually runs job payloads.
pub trait ExecutionEngine: Send + Sync + fmt::Debug {
    fn can_accept_jobs(&self) -> bool;

    fn can_run_job(&self, ctx: &JobContext) -> bool;

    /// `None` means the engine refused the job after all.
    fn submit_job(&self, ctx: JobContext) -> Option<EngineJob>;

    fn record_heartbeat_for_all_threads(&self);

    /// Extra key/values published with each registry heartbeat.
    fn telemetry(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}
