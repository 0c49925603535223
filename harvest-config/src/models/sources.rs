use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use harvest_core::OrchestrationConfig;

use crate::util::{non_empty_var, parse_bool_var, parse_csv_var};

/// Raw configuration as defined in a TOML or JSON file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub database: FileDatabaseConfig,
    pub redis: Option<FileRedisConfig>,
    #[serde(default)]
    pub worker: FileWorkerConfig,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileRedisConfig {
    pub url: String,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileWorkerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// `default` or `satellite`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controllers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub integrations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_capacity: Option<usize>,
}

/// Overrides collected from the process environment.
///
/// Durations stay as raw strings here; the loader parses them so a bad value
/// can be reported against the variable that carried it.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub config_json: Option<String>,

    pub database_url: Option<String>,
    pub database_max_connections: Option<u32>,
    pub redis_url: Option<String>,

    pub agent_id: Option<String>,
    pub agent_type: Option<String>,
    pub tenant_id: Option<String>,
    pub controllers: Option<Vec<String>>,
    pub integrations: Option<Vec<String>>,
    pub engine_capacity: Option<usize>,

    pub fetch_interval: Option<String>,
    pub heartbeat_interval: Option<String>,
    pub max_new_jobs: Option<usize>,
    pub unclaim_on_shutdown: Option<bool>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: non_empty_var("HARVEST_CONFIG_PATH").map(PathBuf::from),
            config_json: non_empty_var("HARVEST_CONFIG_JSON"),

            database_url: non_empty_var("DATABASE_URL"),
            database_max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.trim().parse().ok()),
            redis_url: non_empty_var("REDIS_URL"),

            agent_id: non_empty_var("HARVEST_AGENT_ID"),
            agent_type: non_empty_var("HARVEST_AGENT_TYPE"),
            tenant_id: non_empty_var("HARVEST_TENANT_ID"),
            controllers: parse_csv_var("HARVEST_CONTROLLERS"),
            integrations: parse_csv_var("HARVEST_INTEGRATIONS"),
            engine_capacity: std::env::var("HARVEST_ENGINE_CAPACITY")
                .ok()
                .and_then(|s| s.trim().parse().ok()),

            fetch_interval: non_empty_var("HARVEST_FETCH_INTERVAL"),
            heartbeat_interval: non_empty_var("HARVEST_HEARTBEAT_INTERVAL"),
            max_new_jobs: std::env::var("HARVEST_MAX_NEW_JOBS")
                .ok()
                .and_then(|s| s.trim().parse().ok()),
            unclaim_on_shutdown: parse_bool_var("HARVEST_UNCLAIM_ON_SHUTDOWN"),
        }
    }
}
