pub mod error;

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::anyhow;
use harvest_model::AgentType;
use uuid::Uuid;

use crate::{
    models::{
        Config, ConfigMetadata, ConfigSource, DEFAULT_ENGINE_CAPACITY,
        DEFAULT_MAX_CONNECTIONS, DEFAULT_TENANT, DatabaseConfig, RedisConfig,
        WorkerIdentityConfig,
        sources::{EnvConfig, FileConfig},
    },
    util::{duration_millis, parse_duration},
    validation::{self, ConfigWarnings},
};

use self::error::ConfigLoadError;

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &[
    "harvest.toml",
    "config/harvest.toml",
    "harvest.json",
    "config/harvest.json",
];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

/// Fully composed configuration plus every non-fatal finding.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Load `.env`, read the process environment and compose the result
    /// with the configuration file.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let mut load = self.load_with_env(EnvConfig::gather())?;
        load.config.metadata.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Compose against an already gathered environment. The process
    /// environment is not consulted.
    pub fn load_with_env(
        &self,
        env: EnvConfig,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, source) = self.load_file_config(&env)?;
        let mut warnings = ConfigWarnings::default();
        if file_config.is_none() {
            warnings.push_with_hint(
                "No harvest.toml detected; falling back to environment variables",
                "Pass --config or set HARVEST_CONFIG_PATH to use a configuration file",
            );
        }

        let config = compose_config(file_config.unwrap_or_default(), env, source)?;
        warnings.extend(validation::apply_guard_rails(&config)?);

        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, ConfigSource), ConfigLoadError> {
        let mut source = ConfigPathSource::default();

        if let Some(explicit) = &self.options.config_path {
            source.explicit = Some(explicit.clone());
        } else if let Some(from_env) = &env.config_path {
            source.env = Some(from_env.clone());
        } else if let Some(inline) = &env.config_json {
            let file_config: FileConfig = serde_json::from_str(inline).map_err(|err| {
                ConfigLoadError::Parse {
                    origin: "HARVEST_CONFIG_JSON".to_string(),
                    source: err.into(),
                }
            })?;
            return Ok((Some(file_config), ConfigSource::EnvInline));
        }

        if source.is_empty() {
            source.default = DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists());
        }

        let Some((path, provenance)) = source.resolved_path() else {
            return Ok((None, ConfigSource::Default));
        };

        if !path.exists() {
            if provenance == ConfigPathProvenance::Explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, ConfigSource::Default));
        }

        let file_config = read_file_config(&path)?;
        let source = match provenance {
            ConfigPathProvenance::Explicit => ConfigSource::Explicit(path),
            ConfigPathProvenance::Env => ConfigSource::EnvPath(path),
            ConfigPathProvenance::Default => ConfigSource::File(path),
        };
        Ok((Some(file_config), source))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents =
        fs::read_to_string(path).map_err(|err| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source: err,
        })?;
    let origin = path.display().to_string();

    let parsed = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&contents).map_err(anyhow::Error::from),
        Some("toml") => toml::from_str(&contents).map_err(anyhow::Error::from),
        // Try TOML first, then JSON.
        _ => toml::from_str(&contents).or_else(|toml_err| {
            serde_json::from_str(&contents).map_err(|json_err| {
                anyhow!("toml error: {toml_err}; json error: {json_err}")
            })
        }),
    };
    parsed.map_err(|source| ConfigLoadError::Parse { origin, source })
}

fn compose_config(
    file: FileConfig,
    env: EnvConfig,
    source: ConfigSource,
) -> Result<Config, ConfigLoadError> {
    let FileConfig {
        database: file_database,
        redis: file_redis,
        worker: file_worker,
        orchestration: mut orchestration,
    } = file;

    let database = DatabaseConfig {
        url: env.database_url.or(file_database.url),
        max_connections: env
            .database_max_connections
            .or(file_database.max_connections)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS),
    };

    let redis = env
        .redis_url
        .map(|url| RedisConfig { url })
        .or_else(|| file_redis.map(|r| RedisConfig { url: r.url }));

    let agent_type = match (env.agent_type, file_worker.agent_type) {
        (Some(raw), _) => parse_agent_type("HARVEST_AGENT_TYPE", &raw)?,
        (None, Some(raw)) => parse_agent_type("worker.agent_type", &raw)?,
        (None, None) => AgentType::default(),
    };

    let worker = WorkerIdentityConfig {
        agent_id: env
            .agent_id
            .or(file_worker.agent_id)
            .unwrap_or_else(|| format!("worker-{}", Uuid::now_v7())),
        agent_type,
        tenant_id: env
            .tenant_id
            .or(file_worker.tenant_id)
            .unwrap_or_else(|| DEFAULT_TENANT.to_string()),
        controller_names: env.controllers.unwrap_or(file_worker.controllers),
        integration_ids: env.integrations.unwrap_or(file_worker.integrations),
        engine_capacity: env
            .engine_capacity
            .or(file_worker.engine_capacity)
            .unwrap_or(DEFAULT_ENGINE_CAPACITY),
    };

    let coordinator = &mut orchestration.coordinator;
    if let Some(raw) = env.fetch_interval {
        coordinator.fetch_interval_ms =
            env_duration_ms("HARVEST_FETCH_INTERVAL", &raw)?;
    }
    if let Some(raw) = env.heartbeat_interval {
        coordinator.heartbeat_interval_ms =
            env_duration_ms("HARVEST_HEARTBEAT_INTERVAL", &raw)?;
    }
    if let Some(max_new) = env.max_new_jobs {
        coordinator.max_new_jobs_in_one_cycle = max_new;
    }
    if let Some(unclaim) = env.unclaim_on_shutdown {
        coordinator.unclaim_on_shutdown = unclaim;
    }

    Ok(Config {
        database,
        redis,
        worker,
        orchestration,
        metadata: ConfigMetadata {
            source,
            env_file_loaded: false,
        },
    })
}

fn parse_agent_type(
    variable: &'static str,
    raw: &str,
) -> Result<AgentType, ConfigLoadError> {
    AgentType::parse(raw).map_err(|err| ConfigLoadError::InvalidValue {
        variable,
        reason: err.to_string(),
    })
}

fn env_duration_ms(
    variable: &'static str,
    raw: &str,
) -> Result<u64, ConfigLoadError> {
    parse_duration(raw)
        .map(duration_millis)
        .map_err(|err| ConfigLoadError::InvalidValue {
            variable,
            reason: err.to_string(),
        })
}

#[derive(Debug, Default)]
struct ConfigPathSource {
    explicit: Option<PathBuf>,
    env: Option<PathBuf>,
    default: Option<PathBuf>,
}

impl ConfigPathSource {
    fn is_empty(&self) -> bool {
        self.explicit.is_none() && self.env.is_none() && self.default.is_none()
    }

    fn resolved_path(&self) -> Option<(PathBuf, ConfigPathProvenance)> {
        if let Some(path) = &self.explicit {
            return Some((path.clone(), ConfigPathProvenance::Explicit));
        }
        if let Some(path) = &self.env {
            return Some((path.clone(), ConfigPathProvenance::Env));
        }
        if let Some(path) = &self.default {
            return Some((path.clone(), ConfigPathProvenance::Default));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigPathProvenance {
    Explicit,
    Env,
    Default,
}
