//! Configuration for Harvest workers.
//!
//! Settings are composed from a TOML or JSON file, an optional `.env` file
//! and the process environment, with environment values taking precedence.
//! The composed [`Config`] is checked by guard rails that reject settings the
//! orchestration loops cannot run with and warn about likely mistakes.
#![allow(missing_docs)]

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoader, ConfigLoaderOptions, error::ConfigLoadError};
pub use models::{
    Config, ConfigMetadata, ConfigSource, DatabaseConfig, RedisConfig,
    WorkerIdentityConfig,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
