use std::{collections::BTreeMap, sync::Arc, time::Duration as StdDuration};

use chrono::{Duration, Utc};
use harvest_core::{
    Clock, ManualClock,
    jobs::{
        ChannelFailureSink, FailureSource, InMemoryJobStore, JobInstanceStore, OrphanSweeper,
        SweepReport,
    },
};
use harvest_model::{AgentId, JobDefinitionId, JobInstance, JobStatus, NewJobInstance};
use serde_json::Value;

struct Fixture {
    store: Arc<InMemoryJobStore>,
    clock: ManualClock,
    sweeper: OrphanSweeper,
    failures: tokio::sync::mpsc::Receiver<harvest_core::jobs::PermanentFailure>,
}

fn fixture() -> Fixture {
    let store = Arc::new(InMemoryJobStore::new());
    let clock = ManualClock::new(Utc::now());
    let (sink, failures) = ChannelFailureSink::channel(8);
    let sweeper = OrphanSweeper::new(
        store.clone(),
        Arc::new(sink),
        Arc::new(clock.clone()),
        StdDuration::from_secs(60),
    );
    Fixture {
        store,
        clock,
        sweeper,
        failures,
    }
}

async fn enqueue(fx: &Fixture, attempt_max: u32) -> JobInstance {
    fx.store
        .insert(
            NewJobInstance {
                job_definition_id: JobDefinitionId::new(),
                controller_name: "confluence".into(),
                definition_version: 1,
                priority: 0,
                attempt_max,
                timeout_in_minutes: 5,
                scheduled_start_time: fx.clock.now(),
                payload: Value::Null,
                tags: BTreeMap::new(),
            },
            fx.clock.now(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn crashed_worker_job_is_reclaimed_with_one_more_attempt() {
    let fx = fixture();
    let job = enqueue(&fx, 3).await;
    let crashed = AgentId::new("w-crashed");
    assert!(fx.store.try_claim(job.instance_id, &crashed, fx.clock.now()).await.unwrap());

    fx.clock.advance(Duration::minutes(5));
    let report = fx.sweeper.sweep_once().await.unwrap();
    assert_eq!(report, SweepReport::default(), "deadline is exclusive");

    fx.clock.advance(Duration::seconds(1));
    let report = fx.sweeper.sweep_once().await.unwrap();
    assert_eq!(report.stale, 1);
    assert_eq!(report.requeued, 1);

    let requeued = fx.store.get(job.instance_id).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Unassigned);
    assert_eq!(requeued.attempt_count, 1);
    assert!(requeued.worker_id.is_none());

    let survivor = AgentId::new("w-2");
    assert!(fx.store.try_claim(job.instance_id, &survivor, fx.clock.now()).await.unwrap());
    assert!(!fx.store.complete(job.instance_id, &crashed, fx.clock.now()).await.unwrap());
    assert!(fx.store.complete(job.instance_id, &survivor, fx.clock.now()).await.unwrap());
}

#[tokio::test]
async fn heartbeating_jobs_are_not_swept() {
    let fx = fixture();
    let job = enqueue(&fx, 3).await;
    let worker = AgentId::new("w-1");
    fx.store.try_claim(job.instance_id, &worker, fx.clock.now()).await.unwrap();

    for _ in 0..4 {
        fx.clock.advance(Duration::minutes(3));
        fx.store
            .heartbeat(&[job.instance_id], &worker, fx.clock.now())
            .await
            .unwrap();
        assert_eq!(fx.sweeper.sweep_once().await.unwrap().stale, 0);
    }
}

#[tokio::test]
async fn requeue_is_skipped_when_a_heartbeat_lands_after_listing() {
    let fx = fixture();
    let job = enqueue(&fx, 3).await;
    let worker = AgentId::new("w-1");
    fx.store.try_claim(job.instance_id, &worker, fx.clock.now()).await.unwrap();
    fx.clock.advance(Duration::minutes(6));

    let stale = fx.store.list_stale(fx.clock.now()).await.unwrap();
    assert_eq!(stale.len(), 1);
    fx.store
        .heartbeat(&[job.instance_id], &worker, fx.clock.now())
        .await
        .unwrap();

    let outcome = fx
        .store
        .requeue_orphan(job.instance_id, stale[0].last_heartbeat, fx.clock.now())
        .await
        .unwrap();
    assert!(outcome.is_none());
    let stored = fx.store.get(job.instance_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert!(stored.is_owned_by(&worker));
}

#[tokio::test]
async fn orphan_on_last_attempt_is_reported_as_permanent_failure() {
    let mut fx = fixture();
    let job = enqueue(&fx, 1).await;
    fx.store
        .try_claim(job.instance_id, &AgentId::new("w-1"), fx.clock.now())
        .await
        .unwrap();
    fx.clock.advance(Duration::minutes(10));

    let report = fx.sweeper.sweep_once().await.unwrap();
    assert_eq!(report.exhausted, 1);

    let stored = fx.store.get(job.instance_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failure);
    assert_eq!(stored.attempt_count, 1);

    let failure = fx.failures.recv().await.unwrap();
    assert_eq!(failure.instance_id, job.instance_id);
    assert_eq!(failure.source, FailureSource::Orphaned);
    assert_eq!(failure.controller_name, "confluence");
}
