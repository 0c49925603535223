use std::path::PathBuf;

use thiserror::Error;

use crate::validation::ConfigGuardRailError;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {origin}")]
    Parse {
        origin: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid value for {variable}: {reason}")]
    InvalidValue { variable: &'static str, reason: String },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error("failed to load env file")]
    EnvFile(#[from] dotenvy::Error),
}
