use std::{sync::Arc, time::Duration as StdDuration};

use async_trait::async_trait;
use tokio::sync::Barrier;
use chrono::{DateTime, Duration, Utc};
use harvest_core::{
    Clock, HarvestError, ManualClock, Result,
    config::{CursorConfig, JobsConfig},
    cursor::{StrategyRegistry, keys},
    jobs::InMemoryJobStore,
    trigger::{
        InMemoryTriggerStore, StoreTriggerActionService, TriggerActionService, TriggerRunner,
        TriggerStore,
    },
};
use harvest_model::{
    DbTrigger, JobDefinitionId, JobInstance, NewJobInstance, ScanTags, ScanType, TriggerId,
    TriggerMetadata,
};

/// Delegates to the store-backed service but refuses to enqueue for one
/// integration.
#[derive(Debug)]
struct FlakyActions {
    inner: StoreTriggerActionService,
    broken_integration: &'static str,
}

#[async_trait]
impl TriggerActionService for FlakyActions {
    async fn create_triggered_job(
        &self,
        trigger: &DbTrigger,
        partial: bool,
        request: NewJobInstance,
    ) -> Result<JobInstance> {
        if trigger.integration_key == self.broken_integration {
            return Err(HarvestError::Store("connection reset".into()));
        }
        self.inner.create_triggered_job(trigger, partial, request).await
    }

    async fn update_trigger_metadata(
        &self,
        id: TriggerId,
        expected: &TriggerMetadata,
        metadata: TriggerMetadata,
    ) -> Result<bool> {
        self.inner.update_trigger_metadata(id, expected, metadata).await
    }
}

/// Trigger store whose listing waits until every runner has listed, so all
/// of them decide from the same metadata.
#[derive(Debug)]
struct LockstepTriggers {
    inner: Arc<InMemoryTriggerStore>,
    listed: Barrier,
}

#[async_trait]
impl TriggerStore for LockstepTriggers {
    async fn list_active(&self) -> Result<Vec<DbTrigger>> {
        let active = self.inner.list_active().await?;
        self.listed.wait().await;
        Ok(active)
    }

    async fn get(&self, id: TriggerId) -> Result<Option<DbTrigger>> {
        self.inner.get(id).await
    }

    async fn save(&self, trigger: DbTrigger) -> Result<()> {
        self.inner.save(trigger).await
    }

    async fn update_metadata(&self, id: TriggerId, metadata: TriggerMetadata) -> Result<()> {
        self.inner.update_metadata(id, metadata).await
    }

    async fn compare_and_swap_metadata(
        &self,
        id: TriggerId,
        expected: &TriggerMetadata,
        metadata: TriggerMetadata,
    ) -> Result<bool> {
        self.inner
            .compare_and_swap_metadata(id, expected, metadata)
            .await
    }
}

struct Fixture {
    jobs: Arc<InMemoryJobStore>,
    triggers: Arc<InMemoryTriggerStore>,
    clock: ManualClock,
}

impl Fixture {
    fn new() -> Self {
        Self {
            jobs: Arc::new(InMemoryJobStore::new()),
            triggers: Arc::new(InMemoryTriggerStore::new()),
            clock: ManualClock::new(Utc::now()),
        }
    }

    fn actions(&self) -> StoreTriggerActionService {
        StoreTriggerActionService::new(
            self.jobs.clone(),
            self.triggers.clone(),
            Arc::new(self.clock.clone()),
        )
    }

    fn runner(
        &self,
        actions: Arc<dyn TriggerActionService>,
        cursor: &CursorConfig,
    ) -> TriggerRunner {
        TriggerRunner::new(
            self.triggers.clone(),
            actions,
            StrategyRegistry::from_config(cursor),
            JobsConfig::default(),
            Arc::new(self.clock.clone()),
            StdDuration::from_secs(60),
        )
    }

    async fn add_trigger(
        &self,
        integration_key: &str,
        trigger_type: &str,
        created_at: DateTime<Utc>,
        metadata: TriggerMetadata,
    ) -> DbTrigger {
        let trigger = DbTrigger {
            id: TriggerId::new(),
            integration_key: integration_key.into(),
            trigger_type: trigger_type.into(),
            tenant_id: "tenant-1".into(),
            job_definition_id: JobDefinitionId::new(),
            controller_name: integration_key.into(),
            created_at: Some(created_at),
            enabled: true,
            metadata,
        };
        self.triggers.save(trigger.clone()).await.unwrap();
        trigger
    }

    async fn jobs_for(&self, trigger: &DbTrigger) -> Vec<JobInstance> {
        let id = trigger.id.to_string();
        let mut jobs: Vec<JobInstance> = self
            .jobs
            .snapshot()
            .await
            .into_iter()
            .filter(|job| job.tags.get("trigger_id") == Some(&id))
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    async fn metadata(&self, trigger: &DbTrigger) -> TriggerMetadata {
        self.triggers.get(trigger.id).await.unwrap().unwrap().metadata
    }
}

fn window(job: &JobInstance) -> (DateTime<Utc>, DateTime<Utc>) {
    let from = job.payload["from"].as_str().unwrap();
    let to = job.payload["to"].as_str().unwrap();
    (
        DateTime::parse_from_rfc3339(from).unwrap().with_timezone(&Utc),
        DateTime::parse_from_rfc3339(to).unwrap().with_timezone(&Utc),
    )
}

#[tokio::test]
async fn fresh_onboarding_enqueues_one_full_scan() {
    let fx = Fixture::new();
    let created = fx.clock.now() - Duration::hours(1);
    let trigger = fx
        .add_trigger("jira", "default", created, TriggerMetadata::new())
        .await;
    let runner = fx.runner(Arc::new(fx.actions()), &CursorConfig::default());

    let now = fx.clock.now();
    let report = runner.run_once(now).await.unwrap();
    assert_eq!(report.triggers, 1);
    assert_eq!(report.jobs_created, 1);

    let jobs = fx.jobs_for(&trigger).await;
    assert_eq!(jobs.len(), 1);
    let tags = ScanTags::from_tags(&jobs[0].tags).unwrap();
    assert_eq!(tags.scan_type, ScanType::Full);
    assert!(!tags.partial);
    assert_eq!(window(&jobs[0]), (created, now));
    assert_eq!(jobs[0].controller_name, "jira");
    assert_eq!(jobs[0].job_definition_id, trigger.job_definition_id);

    let metadata = fx.metadata(&trigger).await;
    assert_eq!(metadata.get_datetime(keys::LAST_FULL_SCAN), Some(now));
    assert_eq!(metadata.get_datetime(keys::CURRENT_CURSOR), Some(now));
}

#[tokio::test]
async fn trigger_created_at_now_waits_for_the_next_tick() {
    let fx = Fixture::new();
    let now = fx.clock.now();
    let trigger = fx
        .add_trigger("jira", "default", now, TriggerMetadata::new())
        .await;
    let runner = fx.runner(Arc::new(fx.actions()), &CursorConfig::default());

    let report = runner.run_once(now).await.unwrap();
    assert_eq!(report.jobs_created, 0);
    assert_eq!(report.idle, 1);
    assert!(fx.jobs_for(&trigger).await.is_empty());
    assert!(fx.metadata(&trigger).await.is_empty());

    fx.clock.advance(Duration::minutes(1));
    let later = fx.clock.now();
    runner.run_once(later).await.unwrap();
    let jobs = fx.jobs_for(&trigger).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(ScanTags::from_tags(&jobs[0].tags).unwrap().scan_type, ScanType::Full);
    assert_eq!(window(&jobs[0]), (now, later));
}

#[tokio::test]
async fn runners_sharing_a_store_enqueue_each_window_once() {
    let fx = Fixture::new();
    let trigger = fx
        .add_trigger("jira", "default", fx.clock.now() - Duration::days(2), TriggerMetadata::new())
        .await;
    let shared: Arc<dyn TriggerStore> = Arc::new(LockstepTriggers {
        inner: fx.triggers.clone(),
        listed: Barrier::new(2),
    });
    let runner = || {
        let actions = StoreTriggerActionService::new(
            fx.jobs.clone(),
            shared.clone(),
            Arc::new(fx.clock.clone()),
        );
        TriggerRunner::new(
            shared.clone(),
            Arc::new(actions),
            StrategyRegistry::from_config(&CursorConfig::default()),
            JobsConfig::default(),
            Arc::new(fx.clock.clone()),
            StdDuration::from_secs(60),
        )
    };
    let (a, b) = (runner(), runner());

    let now = fx.clock.now();
    let (first, second) = tokio::join!(a.run_once(now), b.run_once(now));
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.jobs_created + second.jobs_created, 1);
    assert_eq!(first.contended + second.contended, 1);
    assert_eq!(fx.jobs_for(&trigger).await.len(), 1);
    assert_eq!(fx.metadata(&trigger).await.get_datetime(keys::CURRENT_CURSOR), Some(now));
}

#[tokio::test]
async fn next_run_continues_from_the_cursor() {
    let fx = Fixture::new();
    let trigger = fx
        .add_trigger("github", "default", fx.clock.now() - Duration::days(2), TriggerMetadata::new())
        .await;
    let runner = fx.runner(Arc::new(fx.actions()), &CursorConfig::default());

    let first = fx.clock.now();
    runner.run_once(first).await.unwrap();
    fx.clock.advance(Duration::minutes(15));
    let second = fx.clock.now();
    runner.run_once(second).await.unwrap();

    let jobs = fx.jobs_for(&trigger).await;
    assert_eq!(jobs.len(), 2);
    let tags = ScanTags::from_tags(&jobs[1].tags).unwrap();
    assert_eq!(tags.scan_type, ScanType::Forward);
    assert!(tags.partial);
    assert_eq!(window(&jobs[1]), (first, second));

    // Same instant again: empty window, nothing enqueued.
    let report = runner.run_once(second).await.unwrap();
    assert_eq!(report.jobs_created, 0);
    assert_eq!(report.idle, 1);
    assert_eq!(fx.jobs_for(&trigger).await.len(), 2);
}

#[tokio::test]
async fn historical_backfill_finishes_then_resumes_normal_scans() {
    let fx = Fixture::new();
    let cursor = CursorConfig {
        historical_span_secs: 90 * 86_400,
        historical_sub_job_span_secs: 30 * 86_400,
        ..CursorConfig::default()
    };
    let mut metadata = TriggerMetadata::new();
    metadata.set_bool(keys::SHOULD_START_FETCHING_HISTORY, true);
    let trigger = fx
        .add_trigger("salesforce", "iterative_backward", fx.clock.now() - Duration::days(1), metadata)
        .await;
    let runner = fx.runner(Arc::new(fx.actions()), &cursor);

    let start = fx.clock.now();
    for _ in 0..3 {
        runner.run_once(fx.clock.now()).await.unwrap();
        fx.clock.advance(Duration::minutes(1));
    }

    let jobs = fx.jobs_for(&trigger).await;
    assert_eq!(jobs.len(), 3);
    let mut expected_from = start - Duration::days(90);
    for job in &jobs {
        let tags = ScanTags::from_tags(&job.tags).unwrap();
        assert!(tags.historical);
        assert!(tags.partial);
        let (from, to) = window(job);
        assert_eq!(from, expected_from);
        assert!(to - from <= Duration::days(30));
        expected_from = to;
    }
    assert_eq!(expected_from, start);

    let metadata = fx.metadata(&trigger).await;
    assert!(!metadata.get_bool(keys::SHOULD_FETCH_HISTORY));
    assert!(!metadata.contains(keys::HISTORICAL_CURSOR));

    runner.run_once(fx.clock.now()).await.unwrap();
    let jobs = fx.jobs_for(&trigger).await;
    let tags = ScanTags::from_tags(&jobs[3].tags).unwrap();
    assert!(!tags.historical);
    assert_eq!(tags.scan_type, ScanType::Full);
}

#[tokio::test]
async fn iterative_trigger_alternates_forward_and_backward() {
    let fx = Fixture::new();
    let trigger = fx
        .add_trigger("zendesk", "iterative_backward", fx.clock.now() - Duration::days(30), TriggerMetadata::new())
        .await;
    let runner = fx.runner(Arc::new(fx.actions()), &CursorConfig::default());

    for _ in 0..5 {
        runner.run_once(fx.clock.now()).await.unwrap();
        fx.clock.advance(Duration::minutes(10));
    }

    let kinds: Vec<ScanType> = fx
        .jobs_for(&trigger)
        .await
        .iter()
        .map(|job| ScanTags::from_tags(&job.tags).unwrap().scan_type)
        .collect();
    assert_eq!(
        kinds,
        vec![
            ScanType::Full,
            ScanType::Forward,
            ScanType::Backward,
            ScanType::Forward,
            ScanType::Backward,
        ]
    );
}

#[tokio::test]
async fn failing_trigger_does_not_block_the_others() {
    let fx = Fixture::new();
    let created = fx.clock.now() - Duration::hours(2);
    let broken = fx
        .add_trigger("servicenow", "default", created, TriggerMetadata::new())
        .await;
    let healthy = fx
        .add_trigger("jira", "default", created, TriggerMetadata::new())
        .await;
    let runner = fx.runner(
        Arc::new(FlakyActions {
            inner: fx.actions(),
            broken_integration: "servicenow",
        }),
        &CursorConfig::default(),
    );

    let report = runner.run_once(fx.clock.now()).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.jobs_created, 1);

    assert_eq!(fx.jobs_for(&healthy).await.len(), 1);
    assert!(fx.jobs_for(&broken).await.is_empty());
    assert!(fx.metadata(&broken).await.is_empty(), "cursor must not advance without a job");

    // The restored cursor offers the same window again.
    let runner = fx.runner(Arc::new(fx.actions()), &CursorConfig::default());
    let report = runner.run_once(fx.clock.now()).await.unwrap();
    assert_eq!(report.jobs_created, 1);
    assert_eq!(report.idle, 1);
    let retried = fx.jobs_for(&broken).await;
    assert_eq!(retried.len(), 1);
    assert_eq!(window(&retried[0]), (created, fx.clock.now()));
}

#[tokio::test]
async fn backfill_requested_with_only_fetch_history_flag() {
    let fx = Fixture::new();
    let cursor = CursorConfig {
        historical_span_secs: 100 * 86_400,
        historical_sub_job_span_secs: 30 * 86_400,
        ..CursorConfig::default()
    };
    let mut metadata = TriggerMetadata::new();
    metadata.set_bool(keys::SHOULD_FETCH_HISTORY, true);
    let trigger = fx
        .add_trigger("hubspot", "iterative_backward", fx.clock.now() - Duration::days(1), metadata)
        .await;
    let runner = fx.runner(Arc::new(fx.actions()), &cursor);

    // ceil(100 / 30) historical runs.
    let start = fx.clock.now();
    for _ in 0..4 {
        runner.run_once(fx.clock.now()).await.unwrap();
        fx.clock.advance(Duration::minutes(1));
    }

    let jobs = fx.jobs_for(&trigger).await;
    assert_eq!(jobs.len(), 4);
    let mut expected_from = start - Duration::days(100);
    for job in &jobs {
        let tags = ScanTags::from_tags(&job.tags).unwrap();
        assert!(tags.historical);
        let (from, to) = window(job);
        assert_eq!(from, expected_from);
        assert!(to - from <= Duration::days(30));
        expected_from = to;
    }
    assert_eq!(expected_from, start);

    let metadata = fx.metadata(&trigger).await;
    assert!(!metadata.get_bool(keys::SHOULD_FETCH_HISTORY));
    assert!(!metadata.get_bool(keys::SHOULD_START_FETCHING_HISTORY));
    assert!(!metadata.contains(keys::HISTORICAL_CURSOR));

    for _ in 0..3 {
        runner.run_once(fx.clock.now()).await.unwrap();
        fx.clock.advance(Duration::minutes(1));
    }
    let kinds: Vec<(ScanType, bool)> = fx.jobs_for(&trigger).await[4..]
        .iter()
        .map(|job| {
            let tags = ScanTags::from_tags(&job.tags).unwrap();
            (tags.scan_type, tags.historical)
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            (ScanType::Full, false),
            (ScanType::Forward, false),
            (ScanType::Backward, false),
        ]
    );
}
