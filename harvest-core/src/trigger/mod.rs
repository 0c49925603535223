//! Triggers: persistent per-integration schedules that turn cursor
//! decisions into job instances.

mod action;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod runner;

use async_trait::async_trait;
use harvest_model::{DbTrigger, JobInstance, NewJobInstance, TriggerId, TriggerMetadata};

use crate::error::Result;

pub use action::StoreTriggerActionService;
pub use memory::InMemoryTriggerStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresTriggerStore;
pub use runner::{TriggerRunReport, TriggerRunner};

/// Persistence for trigger definitions and their cursor metadata.
#[async_trait]
pub trait TriggerStore: Send + Sync + std::fmt::Debug {
    /// Enabled triggers, oldest first.
    async fn list_active(&self) -> Result<Vec<DbTrigger>>;

    async fn get(&self, id: TriggerId) -> Result<Option<DbTrigger>>;

    /// Upserts a trigger definition including its metadata.
    async fn save(&self, trigger: DbTrigger) -> Result<()>;

    /// Replaces the metadata wholesale. `NotFound` for unknown triggers.
    async fn update_metadata(
        &self,
        id: TriggerId,
        metadata: TriggerMetadata,
    ) -> Result<()>;

    /// Replaces the metadata only if it still equals `expected`. Returns
    /// false when another writer got there first. `NotFound` for unknown
    /// triggers.
    async fn compare_and_swap_metadata(
        &self,
        id: TriggerId,
        expected: &TriggerMetadata,
        metadata: TriggerMetadata,
    ) -> Result<bool>;
}

/// Side effects the trigger runner needs: enqueueing work and persisting the
/// advanced cursor.
#[async_trait]
pub trait TriggerActionService: Send + Sync + std::fmt::Debug {
    /// Enqueues the job for one scan window.
    async fn create_triggered_job(
        &self,
        trigger: &DbTrigger,
        partial: bool,
        request: NewJobInstance,
    ) -> Result<JobInstance>;

    /// Moves the trigger's metadata from `expected` to `metadata`. Returns
    /// false, writing nothing, when the stored metadata no longer equals
    /// `expected`.
    async fn update_trigger_metadata(
        &self,
        id: TriggerId,
        expected: &TriggerMetadata,
        metadata: TriggerMetadata,
    ) -> Result<bool>;
}
