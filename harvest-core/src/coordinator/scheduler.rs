use std::{fmt, sync::Arc};

use async_trait::async_trait;
use harvest_model::{AgentId, JobInstance, JobInstanceId};

use super::SchedulerApi;
use crate::{
    clock::Clock,
    error::Result,
    jobs::{FailureOutcome, JobInstanceStore},
};

/// Scheduler API served straight from a job store.
#[derive(Clone)]
pub struct StoreScheduler {
    store: Arc<dyn JobInstanceStore>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for StoreScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreScheduler")
            .field("store", &self.store)
            .finish()
    }
}

impl StoreScheduler {
    pub fn new(store: Arc<dyn JobInstanceStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl SchedulerApi for StoreScheduler {
    async fn get_jobs_to_run(&self, limit: usize) -> Result<Vec<JobInstance>> {
        self.store.list_claimable(limit, self.clock.now()).await
    }

    async fn claim_job(&self, id: JobInstanceId, worker: &AgentId) -> Result<bool> {
        self.store.try_claim(id, worker, self.clock.now()).await
    }

    async fn unclaim_job(&self, id: JobInstanceId, worker: &AgentId) -> Result<bool> {
        self.store.unclaim(id, worker).await
    }

    async fn heartbeat_jobs(
        &self,
        ids: &[JobInstanceId],
        worker: &AgentId,
    ) -> Result<u64> {
        self.store.heartbeat(ids, worker, self.clock.now()).await
    }

    async fn complete_job(&self, id: JobInstanceId, worker: &AgentId) -> Result<bool> {
        self.store.complete(id, worker, self.clock.now()).await
    }

    async fn fail_job(
        &self,
        id: JobInstanceId,
        worker: &AgentId,
        error: Option<String>,
    ) -> Result<Option<FailureOutcome>> {
        self.store
            .record_failure(id, worker, self.clock.now(), error)
            .await
    }

    async fn owned_jobs(&self, worker: &AgentId) -> Result<Vec<JobInstance>> {
        self.store.list_owned(worker).await
    }
}
