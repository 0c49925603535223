use harvest_model::{JobInstanceId, ParseError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Key-value backend error: {0}")]
    KeyValue(String),

    #[error("Lock contention on {0}")]
    LockContention(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Job {instance_id} exhausted its retries after {attempts} attempts")]
    RetriesExhausted {
        instance_id: JobInstanceId,
        attempts: u32,
    },

    #[error("Merge conflict in slot {slot}: {left} vs {right}")]
    MergeConflict {
        slot: String,
        left: String,
        right: String,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HarvestError {
    /// Errors worth retrying on the next loop tick rather than surfacing as
    /// permanent failures.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HarvestError::Store(_)
                | HarvestError::KeyValue(_)
                | HarvestError::LockContention(_)
                | HarvestError::Timeout(_)
        )
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for HarvestError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => {
                HarvestError::NotFound("row not found".into())
            }
            other => HarvestError::Store(other.to_string()),
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for HarvestError {
    fn from(err: redis::RedisError) -> Self {
        HarvestError::KeyValue(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for HarvestError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        HarvestError::Timeout(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;
