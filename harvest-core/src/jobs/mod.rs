//! Job instance persistence and lifecycle.

pub mod failure;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;
pub mod state;
pub mod sweeper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_model::{AgentId, JobInstance, JobInstanceId, NewJobInstance};

use crate::error::Result;

pub use failure::{
    ChannelFailureSink, FailureSink, FailureSource, PermanentFailure,
    TracingFailureSink,
};
pub use memory::InMemoryJobStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
pub use sweeper::{OrphanSweeper, SweepReport};

/// Result of charging a failed attempt against a job.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Attempts remain; the job is claimable again.
    Requeued(JobInstance),
    /// `attempt_max` reached; the job is terminally `FAILURE`.
    Exhausted(JobInstance),
}

impl FailureOutcome {
    pub fn instance(&self) -> &JobInstance {
        match self {
            FailureOutcome::Requeued(job) | FailureOutcome::Exhausted(job) => job,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, FailureOutcome::Exhausted(_))
    }
}

/// Row-level job storage with owner-checked conditional updates.
///
/// Every mutating call that names a `worker` only takes effect while that
/// worker still owns the job; otherwise it reports `false`/`None` and leaves
/// the row alone.
#[async_trait]
pub trait JobInstanceStore: Send + Sync + std::fmt::Debug {
    async fn insert(
        &self,
        request: NewJobInstance,
        now: DateTime<Utc>,
    ) -> Result<JobInstance>;

    async fn get(&self, id: JobInstanceId) -> Result<Option<JobInstance>>;

    /// Unclaimed jobs due by `now`, lowest priority value first.
    async fn list_claimable(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobInstance>>;

    async fn list_owned(&self, worker: &AgentId) -> Result<Vec<JobInstance>>;

    /// Atomically takes an unowned job. `false` means someone else won.
    async fn try_claim(
        &self,
        id: JobInstanceId,
        worker: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn unclaim(&self, id: JobInstanceId, worker: &AgentId) -> Result<bool>;

    /// Returns how many of `ids` the worker still owned.
    async fn heartbeat(
        &self,
        ids: &[JobInstanceId],
        worker: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    async fn complete(
        &self,
        id: JobInstanceId,
        worker: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn record_failure(
        &self,
        id: JobInstanceId,
        worker: &AgentId,
        now: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<Option<FailureOutcome>>;

    /// Pending jobs whose heartbeat is older than their timeout.
    async fn list_stale(&self, now: DateTime<Utc>) -> Result<Vec<JobInstance>>;

    /// Requeues an orphan only if its heartbeat is still the one observed
    /// when it was listed.
    async fn requeue_orphan(
        &self,
        id: JobInstanceId,
        observed_heartbeat: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureOutcome>>;
}
