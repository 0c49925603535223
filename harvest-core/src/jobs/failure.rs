//! Reporting of jobs that exhausted their attempts.

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_model::{JobDefinitionId, JobInstance, JobInstanceId};
use tokio::sync::mpsc;
use tracing::error;

use crate::error::HarvestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSource {
    /// The execution engine reported the final attempt as failed.
    Execution,
    /// The final attempt stopped heartbeating and was swept.
    Orphaned,
}

impl fmt::Display for FailureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureSource::Execution => "execution",
            FailureSource::Orphaned => "orphaned",
        })
    }
}

/// A job that will not be retried again.
#[derive(Debug, Clone, PartialEq)]
pub struct PermanentFailure {
    pub instance_id: JobInstanceId,
    pub job_definition_id: JobDefinitionId,
    pub controller_name: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub source: FailureSource,
    pub reported_at: DateTime<Utc>,
}

impl PermanentFailure {
    pub fn from_instance(
        job: &JobInstance,
        source: FailureSource,
        reported_at: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id: job.instance_id,
            job_definition_id: job.job_definition_id,
            controller_name: job.controller_name.clone(),
            attempts: job.attempt_count,
            last_error: job.last_error.clone(),
            tags: job.tags.clone(),
            source,
            reported_at,
        }
    }

    pub fn to_error(&self) -> HarvestError {
        HarvestError::RetriesExhausted {
            instance_id: self.instance_id,
            attempts: self.attempts,
        }
    }
}

/// Destination for permanent failures. Implementations must not drop
/// reports silently.
#[async_trait]
pub trait FailureSink: Send + Sync + fmt::Debug {
    async fn report(&self, failure: PermanentFailure);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFailureSink;

#[async_trait]
impl FailureSink for TracingFailureSink {
    async fn report(&self, failure: PermanentFailure) {
        error!(
            instance = %failure.instance_id,
            controller = %failure.controller_name,
            attempts = failure.attempts,
            source = %failure.source,
            last_error = failure.last_error.as_deref().unwrap_or(""),
            "{}",
            failure.to_error()
        );
    }
}

/// Forwards failures to whoever owns the trigger lifecycle. Falls back to
/// logging if the receiving side has gone away.
#[derive(Debug, Clone)]
pub struct ChannelFailureSink {
    tx: mpsc::Sender<PermanentFailure>,
}

impl ChannelFailureSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PermanentFailure>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FailureSink for ChannelFailureSink {
    async fn report(&self, failure: PermanentFailure) {
        if let Err(mpsc::error::SendError(failure)) = self.tx.send(failure).await {
            TracingFailureSink.report(failure).await;
        }
    }
}
