use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_model::JobInstanceId;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{EngineJob, EngineOutcome, ExecutionEngine, JobContext};
use crate::{clock::Clock, error::Result};

/// Executes the payload of one controller kind.
#[async_trait]
pub trait JobHandler: Send + Sync + fmt::Debug {
    /// An `Err` is reported to the scheduler as a failed attempt.
    async fn run(&self, ctx: JobContext) -> Result<()>;
}

#[derive(Debug, Default)]
struct EngineState {
    /// Start time of every running job.
    running: HashMap<JobInstanceId, DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
}

/// Execution engine with a fixed number of slots and one handler per
/// controller name.
pub struct BoundedExecutionEngine {
    slots: Arc<Semaphore>,
    capacity: usize,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<EngineState>>,
}

impl fmt::Debug for BoundedExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<&String> = self.handlers.keys().collect();
        handlers.sort();
        f.debug_struct("BoundedExecutionEngine")
            .field("capacity", &self.capacity)
            .field("available", &self.slots.available_permits())
            .field("handlers", &handlers)
            .finish()
    }
}

fn lock(state: &Mutex<EngineState>) -> MutexGuard<'_, EngineState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BoundedExecutionEngine {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            handlers: HashMap::new(),
            clock,
            state: Arc::new(Mutex::new(EngineState::default())),
        }
    }

    pub fn with_handler(
        mut self,
        controller_name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        self.handlers.insert(controller_name.into(), handler);
        self
    }

    pub fn controller_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn running(&self) -> usize {
        lock(&self.state).running.len()
    }
}

impl ExecutionEngine for BoundedExecutionEngine {
    fn can_accept_jobs(&self) -> bool {
        self.slots.available_permits() > 0
    }

    fn can_run_job(&self, ctx: &JobContext) -> bool {
        self.handlers.contains_key(ctx.controller_name())
    }

    fn submit_job(&self, ctx: JobContext) -> Option<EngineJob> {
        let handler = Arc::clone(self.handlers.get(ctx.controller_name())?);
        let permit = Arc::clone(&self.slots).try_acquire_owned().ok()?;

        let instance_id = ctx.instance_id();
        let (job, done) = EngineJob::new(instance_id);
        lock(&self.state).running.insert(instance_id, self.clock.now());

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            debug!(instance = %instance_id, controller = %ctx.controller_name(), "job started");
            let outcome = match handler.run(ctx).await {
                Ok(()) => EngineOutcome::Success,
                Err(err) => EngineOutcome::Failure(err.to_string()),
            };
            lock(&state).running.remove(&instance_id);
            drop(permit);
            if done.send(outcome).is_err() {
                warn!(instance = %instance_id, "job outcome dropped; nobody is watching");
            }
        });

        Some(job)
    }

    fn record_heartbeat_for_all_threads(&self) {
        lock(&self.state).last_heartbeat = Some(self.clock.now());
    }

    fn telemetry(&self) -> BTreeMap<String, String> {
        let state = lock(&self.state);
        let mut telemetry = BTreeMap::new();
        telemetry.insert("engine.capacity".into(), self.capacity.to_string());
        telemetry.insert("engine.running".into(), state.running.len().to_string());
        if let Some(oldest) = state.running.values().min() {
            telemetry.insert("engine.oldest_job_started".into(), oldest.to_rfc3339());
        }
        if let Some(beat) = state.last_heartbeat {
            telemetry.insert("engine.last_heartbeat".into(), beat.to_rfc3339());
        }
        telemetry
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use harvest_model::{AgentId, JobDefinitionId, NewJobInstance};
    use serde_json::Value;
    use tokio::sync::Notify;

    use super::*;
    use crate::{clock::SystemClock, error::HarvestError};

    #[derive(Debug)]
    struct Gate(Arc<Notify>);

    #[async_trait]
    impl JobHandler for Gate {
        async fn run(&self, _ctx: JobContext) -> Result<()> {
            self.0.notified().await;
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Broken;

    #[async_trait]
    impl JobHandler for Broken {
        async fn run(&self, _ctx: JobContext) -> Result<()> {
            Err(HarvestError::Internal("provider returned 500".into()))
        }
    }

    fn ctx(controller: &str) -> JobContext {
        let now = Utc::now();
        let job = NewJobInstance {
            job_definition_id: JobDefinitionId::new(),
            controller_name: controller.into(),
            definition_version: 1,
            priority: 0,
            attempt_max: 3,
            timeout_in_minutes: 5,
            scheduled_start_time: now,
            payload: Value::Null,
            tags: BTreeMap::new(),
        }
        .into_instance(JobInstanceId::new(), now);
        JobContext::new(job, AgentId::new("w-1"))
    }

    #[tokio::test]
    async fn admission_is_bounded_by_capacity() {
        let gate = Arc::new(Notify::new());
        let engine = BoundedExecutionEngine::new(1, Arc::new(SystemClock))
            .with_handler("jira", Arc::new(Gate(Arc::clone(&gate))));

        let first = engine.submit_job(ctx("jira")).unwrap();
        assert!(!engine.can_accept_jobs());
        assert!(engine.submit_job(ctx("jira")).is_none());

        gate.notify_one();
        assert_eq!(first.wait().await, EngineOutcome::Success);
        assert!(engine.can_accept_jobs());
        assert_eq!(engine.running(), 0);
    }

    #[tokio::test]
    async fn unknown_controllers_are_not_runnable() {
        let engine = BoundedExecutionEngine::new(2, Arc::new(SystemClock))
            .with_handler("github", Arc::new(Broken));
        assert!(!engine.can_run_job(&ctx("gitlab")));
        assert!(engine.submit_job(ctx("gitlab")).is_none());

        let job = engine.submit_job(ctx("github")).unwrap();
        assert!(matches!(job.wait().await, EngineOutcome::Failure(msg) if msg.contains("500")));
    }
}
