//! Pure job instance transitions shared by every store.
//!
//! Each function either applies the whole transition and reports success, or
//! leaves the instance untouched. Owner-checked transitions compare the
//! caller against `worker_id`; stale owners always get `false`/`None`.

use chrono::{DateTime, Utc};
use harvest_model::{AgentId, JobInstance, JobStatus};

use super::FailureOutcome;

pub const ORPHAN_ERROR: &str = "heartbeat timed out";

pub fn claim(job: &mut JobInstance, worker: &AgentId, now: DateTime<Utc>) -> bool {
    if job.status != JobStatus::Unassigned || job.worker_id.is_some() {
        return false;
    }
    job.status = JobStatus::Pending;
    job.worker_id = Some(worker.clone());
    job.start_time = Some(now);
    job.last_heartbeat = Some(now);
    true
}

/// Hands the job back without charging an attempt.
pub fn unclaim(job: &mut JobInstance, worker: &AgentId) -> bool {
    if !owns_pending(job, worker) {
        return false;
    }
    reset_to_unassigned(job);
    true
}

/// Heartbeats never move backwards.
pub fn heartbeat(job: &mut JobInstance, worker: &AgentId, now: DateTime<Utc>) -> bool {
    if !owns_pending(job, worker) {
        return false;
    }
    job.last_heartbeat = Some(job.last_heartbeat.map_or(now, |beat| beat.max(now)));
    true
}

pub fn complete(job: &mut JobInstance, worker: &AgentId, now: DateTime<Utc>) -> bool {
    if !owns_pending(job, worker) {
        return false;
    }
    job.status = JobStatus::Success;
    job.end_time = Some(now);
    job.last_error = None;
    true
}

pub fn fail(
    job: &mut JobInstance,
    worker: &AgentId,
    now: DateTime<Utc>,
    error: Option<String>,
) -> Option<FailureOutcome> {
    if !owns_pending(job, worker) {
        return None;
    }
    Some(charge_attempt(job, now, error))
}

/// Force-requeues a timed-out job. Counts as a failed attempt.
pub fn requeue_orphan(job: &mut JobInstance, now: DateTime<Utc>) -> Option<FailureOutcome> {
    if !job.is_orphaned(now) {
        return None;
    }
    Some(charge_attempt(job, now, Some(ORPHAN_ERROR.to_string())))
}

fn owns_pending(job: &JobInstance, worker: &AgentId) -> bool {
    job.status == JobStatus::Pending && job.is_owned_by(worker)
}

fn reset_to_unassigned(job: &mut JobInstance) {
    job.status = JobStatus::Unassigned;
    job.worker_id = None;
    job.start_time = None;
    job.last_heartbeat = None;
}

fn charge_attempt(
    job: &mut JobInstance,
    now: DateTime<Utc>,
    error: Option<String>,
) -> FailureOutcome {
    job.attempt_count = (job.attempt_count + 1).min(job.attempt_max);
    job.last_error = error;
    if job.attempt_count >= job.attempt_max {
        job.status = JobStatus::Failure;
        job.worker_id = None;
        job.end_time = Some(now);
        FailureOutcome::Exhausted(job.clone())
    } else {
        reset_to_unassigned(job);
        FailureOutcome::Requeued(job.clone())
    }
}
