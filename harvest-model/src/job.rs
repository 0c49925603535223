use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::{
    error::ParseError,
    ids::{AgentId, JobDefinitionId, JobInstanceId},
};

/// Lifecycle states of a job instance.
///
/// `Unassigned -> Pending -> (Success | Failure)`. A failure with retries
/// remaining goes back to `Unassigned`; `Failure` itself is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum JobStatus {
    Unassigned,
    Pending,
    Success,
    Failure,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Unassigned => "UNASSIGNED",
            JobStatus::Pending => "PENDING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failure => "FAILURE",
        }
    }

    /// Case-insensitive parse of the persisted status column.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "UNASSIGNED" => Ok(JobStatus::Unassigned),
            "PENDING" => Ok(JobStatus::Pending),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILURE" => Ok(JobStatus::Failure),
            _ => Err(ParseError::new("job status", raw)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }
}

impl FromStr for JobStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One concrete unit of executable work.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JobInstance {
    pub instance_id: JobInstanceId,
    pub job_definition_id: JobDefinitionId,
    /// Job kind; matched against `AgentHandle::controller_names`.
    pub controller_name: String,
    pub definition_version: u32,
    pub worker_id: Option<AgentId>,
    pub status: JobStatus,
    /// Lower values are scheduled first.
    pub priority: i32,
    pub attempt_count: u32,
    pub attempt_max: u32,
    pub timeout_in_minutes: u32,
    pub scheduled_start_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub payload: Value,
    #[cfg_attr(feature = "serde", serde(default))]
    pub tags: BTreeMap<String, String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobInstance {
    pub fn is_owned_by(&self, worker: &AgentId) -> bool {
        self.worker_id.as_ref() == Some(worker)
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Unassigned
            && self.worker_id.is_none()
            && self.scheduled_start_time <= now
    }

    pub fn retries_remaining(&self) -> u32 {
        self.attempt_max.saturating_sub(self.attempt_count)
    }

    pub fn timeout(&self) -> Duration {
        Duration::minutes(i64::from(self.timeout_in_minutes))
    }

    /// Instant after which a pending job without a fresher heartbeat is
    /// considered orphaned.
    pub fn heartbeat_deadline(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat
            .or(self.start_time)
            .map(|beat| beat + self.timeout())
    }

    pub fn is_orphaned(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self
                .heartbeat_deadline()
                .is_some_and(|deadline| deadline < now)
    }
}

/// Request to persist a fresh, unclaimed job instance.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NewJobInstance {
    pub job_definition_id: JobDefinitionId,
    pub controller_name: String,
    pub definition_version: u32,
    pub priority: i32,
    pub attempt_max: u32,
    pub timeout_in_minutes: u32,
    pub scheduled_start_time: DateTime<Utc>,
    pub payload: Value,
    #[cfg_attr(feature = "serde", serde(default))]
    pub tags: BTreeMap<String, String>,
}

impl NewJobInstance {
    pub fn into_instance(
        self,
        instance_id: JobInstanceId,
        now: DateTime<Utc>,
    ) -> JobInstance {
        JobInstance {
            instance_id,
            job_definition_id: self.job_definition_id,
            controller_name: self.controller_name,
            definition_version: self.definition_version,
            worker_id: None,
            status: JobStatus::Unassigned,
            priority: self.priority,
            attempt_count: 0,
            attempt_max: self.attempt_max.max(1),
            timeout_in_minutes: self.timeout_in_minutes,
            scheduled_start_time: self.scheduled_start_time,
            start_time: None,
            last_heartbeat: None,
            end_time: None,
            payload: self.payload,
            tags: self.tags,
            last_error: None,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(now: DateTime<Utc>) -> JobInstance {
        NewJobInstance {
            job_definition_id: JobDefinitionId::new(),
            controller_name: "jira".into(),
            definition_version: 1,
            priority: 0,
            attempt_max: 3,
            timeout_in_minutes: 10,
            scheduled_start_time: now,
            payload: Value::Null,
            tags: BTreeMap::new(),
        }
        .into_instance(JobInstanceId::new(), now)
    }

    #[test]
    fn status_parse_accepts_any_case() {
        assert_eq!(JobStatus::parse("pending").unwrap(), JobStatus::Pending);
        assert_eq!(JobStatus::parse("Failure").unwrap(), JobStatus::Failure);
        let err = JobStatus::parse("RUNNING").unwrap_err();
        assert_eq!(err.kind, "job status");
    }

    #[test]
    fn orphan_detection_uses_last_heartbeat() {
        let now = Utc::now();
        let mut job = sample(now);
        job.status = JobStatus::Pending;
        job.start_time = Some(now - Duration::minutes(30));
        job.last_heartbeat = Some(now - Duration::minutes(5));
        assert!(!job.is_orphaned(now));

        job.last_heartbeat = Some(now - Duration::minutes(11));
        assert!(job.is_orphaned(now));
    }

    #[test]
    fn attempt_max_is_at_least_one() {
        let now = Utc::now();
        let mut request = NewJobInstance {
            job_definition_id: JobDefinitionId::new(),
            controller_name: "github".into(),
            definition_version: 1,
            priority: 0,
            attempt_max: 0,
            timeout_in_minutes: 10,
            scheduled_start_time: now,
            payload: Value::Null,
            tags: BTreeMap::new(),
        };
        request.priority = 2;
        let job = request.into_instance(JobInstanceId::new(), now);
        assert_eq!(job.attempt_max, 1);
        assert!(job.is_claimable(now));
    }
}
