//! Core data model definitions shared across Harvest crates.
#![allow(missing_docs)]

pub use ::chrono;

pub mod agent;
pub mod error;
pub mod ids;
pub mod job;
pub mod scan;
pub mod trigger;

// Intentionally curated re-exports for downstream consumers.
pub use agent::{AgentHandle, AgentType, LOG_TELEMETRY_KEY, RegisteredAgent};
pub use error::ParseError;
pub use ids::{AgentId, JobDefinitionId, JobInstanceId, TenantId, TriggerId};
pub use job::{JobInstance, JobStatus, NewJobInstance};
pub use scan::{ScanTags, ScanType};
pub use trigger::{DbTrigger, TriggerMetadata};
