pub mod sources;

use std::path::PathBuf;

use harvest_core::OrchestrationConfig;
use harvest_model::{AgentHandle, AgentType};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_ENGINE_CAPACITY: usize = 4;
pub const DEFAULT_TENANT: &str = "default";

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub redis: Option<RedisConfig>,
    pub worker: WorkerIdentityConfig,
    pub orchestration: OrchestrationConfig,
    pub metadata: ConfigMetadata,
}

impl Config {
    /// Announcement this worker registers with.
    pub fn agent_handle(&self) -> AgentHandle {
        AgentHandle::new(
            self.worker.agent_id.as_str(),
            self.worker.agent_type,
            self.worker.tenant_id.as_str(),
        )
        .with_controllers(self.worker.controller_names.iter().cloned())
        .with_integrations(self.worker.integration_ids.iter().cloned())
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct WorkerIdentityConfig {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub tenant_id: String,
    /// Job kinds this worker executes.
    pub controller_names: Vec<String>,
    pub integration_ids: Vec<String>,
    /// Concurrent jobs the local engine admits.
    pub engine_capacity: usize,
}

/// Where the file-level configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    /// Explicit path from the CLI.
    Explicit(PathBuf),
    /// `HARVEST_CONFIG_PATH`.
    EnvPath(PathBuf),
    /// `HARVEST_CONFIG_JSON`.
    EnvInline,
    /// One of the well-known default locations.
    File(PathBuf),
}

impl ConfigSource {
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            ConfigSource::Explicit(path)
            | ConfigSource::EnvPath(path)
            | ConfigSource::File(path) => Some(path),
            ConfigSource::Default | ConfigSource::EnvInline => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub source: ConfigSource,
    pub env_file_loaded: bool,
}
