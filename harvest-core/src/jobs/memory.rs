use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_model::{
    AgentId, JobInstance, JobInstanceId, JobStatus, NewJobInstance,
};
use tokio::sync::Mutex;

use super::{FailureOutcome, JobInstanceStore, state};
use crate::error::Result;

/// Job store held in process memory. A single mutex linearizes every
/// transition, which is what the Postgres row lock gives the durable store.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<Mutex<HashMap<JobInstanceId, JobInstance>>>,
}

impl fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .jobs
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryJobStore").field("jobs", &len).finish()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<JobInstance> {
        let mut jobs: Vec<JobInstance> =
            self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.instance_id);
        jobs
    }
}

#[async_trait]
impl JobInstanceStore for InMemoryJobStore {
    async fn insert(
        &self,
        request: NewJobInstance,
        now: DateTime<Utc>,
    ) -> Result<JobInstance> {
        let job = request.into_instance(JobInstanceId::new(), now);
        self.jobs.lock().await.insert(job.instance_id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobInstanceId) -> Result<Option<JobInstance>> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn list_claimable(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobInstance>> {
        let jobs = self.jobs.lock().await;
        let mut claimable: Vec<JobInstance> = jobs
            .values()
            .filter(|job| job.is_claimable(now))
            .cloned()
            .collect();
        claimable.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.scheduled_start_time.cmp(&b.scheduled_start_time))
                .then(a.instance_id.cmp(&b.instance_id))
        });
        claimable.truncate(limit);
        Ok(claimable)
    }

    async fn list_owned(&self, worker: &AgentId) -> Result<Vec<JobInstance>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.is_owned_by(worker))
            .cloned()
            .collect())
    }

    async fn try_claim(
        &self,
        id: JobInstanceId,
        worker: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        Ok(jobs
            .get_mut(&id)
            .is_some_and(|job| state::claim(job, worker, now)))
    }

    async fn unclaim(&self, id: JobInstanceId, worker: &AgentId) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        Ok(jobs
            .get_mut(&id)
            .is_some_and(|job| state::unclaim(job, worker)))
    }

    async fn heartbeat(
        &self,
        ids: &[JobInstanceId],
        worker: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut jobs = self.jobs.lock().await;
        let mut touched = 0;
        for id in ids {
            if jobs
                .get_mut(id)
                .is_some_and(|job| state::heartbeat(job, worker, now))
            {
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn complete(
        &self,
        id: JobInstanceId,
        worker: &AgentId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        Ok(jobs
            .get_mut(&id)
            .is_some_and(|job| state::complete(job, worker, now)))
    }

    async fn record_failure(
        &self,
        id: JobInstanceId,
        worker: &AgentId,
        now: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<Option<FailureOutcome>> {
        let mut jobs = self.jobs.lock().await;
        Ok(jobs
            .get_mut(&id)
            .and_then(|job| state::fail(job, worker, now, error)))
    }

    async fn list_stale(&self, now: DateTime<Utc>) -> Result<Vec<JobInstance>> {
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|job| job.is_orphaned(now))
            .cloned()
            .collect())
    }

    async fn requeue_orphan(
        &self,
        id: JobInstanceId,
        observed_heartbeat: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureOutcome>> {
        let mut jobs = self.jobs.lock().await;
        Ok(jobs
            .get_mut(&id)
            .filter(|job| job.last_heartbeat == observed_heartbeat)
            .and_then(|job| state::requeue_orphan(job, now)))
    }
}
