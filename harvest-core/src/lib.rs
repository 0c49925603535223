//! # Harvest Core
//!
//! Orchestration core for distributed data-ingestion workers: discovery of
//! live workers, cursor-based scan scheduling, exclusive job claiming and
//! recombination of sub-job results.
//!
//! ## Overview
//!
//! - **Agent Registry**: TTL-bound discovery of workers and the job kinds they run
//! - **Cursor Strategies**: next scan window per trigger (forward, backward, full, historical)
//! - **Job Claim Coordinator**: fetch, claim, admit and heartbeat loop on each worker
//! - **Job Instances**: owner-checked state machine with retry accounting and orphan sweeping
//! - **Trigger Runner**: turns cursor decisions into enqueued jobs
//! - **Result Merger**: folds sub-job outputs by declared merge strategy
//!
//! ## Feature Flags
//!
//! - `postgres`: Postgres job/trigger stores and the bundled migrations
//! - `redis`: Redis-backed registry store and distributed lock
//!
//! ## Architecture
//!
//! - [`registry`]: agent discovery over a [`kv::KeyValueStore`]
//! - [`cursor`]: pure scheduling strategies
//! - [`jobs`]: persistence, lifecycle transitions and the orphan sweeper
//! - [`coordinator`]: worker-side claim loop and execution engine seam
//! - [`trigger`]: trigger persistence and the periodic runner
//! - [`merge`]: result recombination
#![allow(missing_docs)]

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod error;
pub mod jobs;
pub mod kv;
pub mod merge;
pub mod registry;
pub mod schedule;
pub mod trigger;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OrchestrationConfig;
pub use error::{HarvestError, Result};

/// Embedded schema migrations for the Postgres stores.
#[cfg(feature = "postgres")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
