use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Every tunable of the orchestration core in one place.
///
/// All sections carry defaults so a deployment only needs to spell out the
/// values it wants to change.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Worker-side fetch/heartbeat loop cadence and admission limits.
    pub coordinator: CoordinatorConfig,
    /// Agent liveness TTL, key layout and registry lock tuning.
    pub registry: RegistryConfig,
    /// Window sizes used by the cursor strategies.
    pub cursor: CursorConfig,
    /// Defaults stamped onto new job instances and orphan sweep cadence.
    pub jobs: JobsConfig,
    /// Trigger runner cadence.
    pub trigger: TriggerConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub fetch_interval_ms: u64,
    /// Must be shorter than both the fetch interval and the agent TTL.
    pub heartbeat_interval_ms: u64,
    pub warmup_delay_ms: u64,
    /// Upper bound of the random jitter added on top of the warm-up delay.
    pub start_jitter_ms: u64,
    pub max_new_jobs_in_one_cycle: usize,
    /// Candidates requested from the scheduler per fetch cycle.
    pub candidate_fetch_limit: usize,
    /// Bound applied to every scheduler/registry call.
    pub call_timeout_ms: u64,
    pub unclaim_on_shutdown: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            fetch_interval_ms: 10_000,
            heartbeat_interval_ms: 5_000,
            warmup_delay_ms: 2_000,
            start_jitter_ms: 500,
            max_new_jobs_in_one_cycle: 10,
            candidate_fetch_limit: 50,
            call_timeout_ms: 15_000,
            unclaim_on_shutdown: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn fetch_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn warmup_delay(&self) -> Duration {
        Duration::from_millis(self.warmup_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Liveness TTL; an agent is expired once its heartbeat is older.
    pub agent_timeout_secs: u64,
    /// How long registry keys survive in the backend. Kept longer than the
    /// TTL so stale entries can still be listed with `include_expired`.
    pub agent_retention_secs: u64,
    pub lock_ttl_ms: u64,
    pub lock_retry_attempts: u32,
    pub lock_retry_delay_ms: u64,
    pub key_prefix: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            agent_timeout_secs: 90,
            agent_retention_secs: 270,
            lock_ttl_ms: 5_000,
            lock_retry_attempts: 5,
            lock_retry_delay_ms: 50,
            key_prefix: "harvest".to_string(),
        }
    }
}

impl RegistryConfig {
    pub fn agent_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.agent_timeout_secs))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.agent_retention_secs.max(self.agent_timeout_secs))
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    pub full_scan_frequency_secs: u64,
    /// How far back the first scan of a trigger reaches when the trigger has
    /// no creation time of its own.
    pub onboarding_span_secs: u64,
    pub backward_sub_job_span_secs: u64,
    pub historical_span_secs: u64,
    pub historical_sub_job_span_secs: u64,
    /// Trigger types scheduled with the iterative backward-scan strategy;
    /// every other type uses the default strategy.
    pub iterative_trigger_types: Vec<String>,
}

const DAY_SECS: u64 = 24 * 60 * 60;

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            full_scan_frequency_secs: 7 * DAY_SECS,
            onboarding_span_secs: 90 * DAY_SECS,
            backward_sub_job_span_secs: 7 * DAY_SECS,
            historical_span_secs: 3 * 365 * DAY_SECS,
            historical_sub_job_span_secs: 30 * DAY_SECS,
            iterative_trigger_types: vec!["iterative_backward".to_string()],
        }
    }
}

impl CursorConfig {
    pub fn full_scan_frequency(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.full_scan_frequency_secs))
    }

    pub fn onboarding_span(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.onboarding_span_secs))
    }

    pub fn backward_sub_job_span(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.backward_sub_job_span_secs))
    }

    pub fn historical_span(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.historical_span_secs))
    }

    pub fn historical_sub_job_span(&self) -> chrono::Duration {
        chrono::Duration::seconds(secs_i64(self.historical_sub_job_span_secs))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub default_attempt_max: u32,
    pub default_timeout_minutes: u32,
    pub default_priority: i32,
    pub sweep_interval_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            default_attempt_max: 3,
            default_timeout_minutes: 60,
            default_priority: 0,
            sweep_interval_ms: 60_000,
        }
    }
}

impl JobsConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub run_interval_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            run_interval_ms: 60_000,
        }
    }
}

impl TriggerConfig {
    pub fn run_interval(&self) -> Duration {
        Duration::from_millis(self.run_interval_ms)
    }
}

fn secs_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1_000)
}
