use thiserror::Error;

use super::models::Config;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },
    #[error("engine capacity must be at least 1")]
    NoEngineCapacity,
    #[error("agent id must not be empty")]
    EmptyAgentId,
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.items.iter().any(|w| w.message.contains(needle))
    }
}

/// Rejects settings the orchestration loops cannot run with and collects
/// warnings for ones that work but are likely mistakes.
pub fn apply_guard_rails(
    config: &Config,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let orchestration = &config.orchestration;
    let coordinator = &orchestration.coordinator;

    if config.worker.agent_id.trim().is_empty() {
        return Err(ConfigGuardRailError::EmptyAgentId);
    }
    if config.worker.engine_capacity == 0 {
        return Err(ConfigGuardRailError::NoEngineCapacity);
    }

    require_positive("coordinator.fetch_interval_ms", coordinator.fetch_interval_ms)?;
    require_positive(
        "coordinator.heartbeat_interval_ms",
        coordinator.heartbeat_interval_ms,
    )?;
    require_positive(
        "coordinator.max_new_jobs_in_one_cycle",
        coordinator.max_new_jobs_in_one_cycle as u64,
    )?;
    require_positive("coordinator.call_timeout_ms", coordinator.call_timeout_ms)?;
    require_positive(
        "registry.agent_timeout_secs",
        orchestration.registry.agent_timeout_secs,
    )?;
    require_positive(
        "cursor.full_scan_frequency_secs",
        orchestration.cursor.full_scan_frequency_secs,
    )?;
    require_positive(
        "cursor.backward_sub_job_span_secs",
        orchestration.cursor.backward_sub_job_span_secs,
    )?;
    require_positive(
        "cursor.historical_sub_job_span_secs",
        orchestration.cursor.historical_sub_job_span_secs,
    )?;
    require_positive("jobs.default_attempt_max", orchestration.jobs.default_attempt_max.into())?;
    require_positive("jobs.sweep_interval_ms", orchestration.jobs.sweep_interval_ms)?;
    require_positive("trigger.run_interval_ms", orchestration.trigger.run_interval_ms)?;

    let ttl_ms = orchestration.registry.agent_timeout_secs.saturating_mul(1_000);
    if coordinator.heartbeat_interval_ms >= ttl_ms {
        warnings.push_with_hint(
            "heartbeat interval is not shorter than the agent TTL; this worker will flap between live and expired",
            "Lower coordinator.heartbeat_interval_ms or raise registry.agent_timeout_secs",
        );
    }
    if coordinator.heartbeat_interval_ms >= coordinator.fetch_interval_ms {
        warnings.push(
            "heartbeat interval is not shorter than the fetch interval",
        );
    }
    if coordinator.candidate_fetch_limit < coordinator.max_new_jobs_in_one_cycle {
        warnings.push_with_hint(
            "candidate fetch limit is below max new jobs per cycle; cycles can never fill up",
            "Raise coordinator.candidate_fetch_limit",
        );
    }

    if config.redis.is_none() {
        warnings.push_with_hint(
            "REDIS_URL not configured; the agent registry is process-local",
            "Set REDIS_URL so workers in other processes can see each other",
        );
    }
    if config.database.url.is_none() {
        warnings.push_with_hint(
            "DATABASE_URL not configured; jobs and triggers are kept in memory",
            "Set DATABASE_URL to share the job queue between workers",
        );
    }
    if config.worker.controller_names.is_empty() {
        warnings.push_with_hint(
            "no controllers configured; this worker will never claim a job",
            "Set HARVEST_CONTROLLERS or worker.controllers",
        );
    }

    Ok(warnings)
}

fn require_positive(
    field: &'static str,
    value: u64,
) -> Result<(), ConfigGuardRailError> {
    if value == 0 {
        return Err(ConfigGuardRailError::ZeroValue { field });
    }
    Ok(())
}
