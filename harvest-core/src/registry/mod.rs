//! Agent liveness and discovery directory.
//!
//! Key layout under the configured prefix `p`:
//! - `p:agent:{id}` the `RegisteredAgent` record with its log telemetry removed
//! - `p:agent-log:{id}` the log telemetry split out of the record
//! - `p:controller:{name}` hash of agent ids able to run `name`
//! - `p:agents` hash of every registered agent id
//! - `p:lock:agent:{id}` lock guarding the multi-key registration update
//!
//! Keys live for the configured retention, which outlasts the liveness TTL so
//! expired agents can still be listed on request.

use std::{collections::BTreeSet, fmt, sync::Arc};

use harvest_model::{AgentHandle, AgentId, LOG_TELEMETRY_KEY, RegisteredAgent};
use tracing::{debug, info};

use crate::{
    clock::Clock,
    config::RegistryConfig,
    error::Result,
    kv::{DistributedLock, KeyValueStore, LockRetry, with_lock},
};

#[derive(Clone, Debug)]
struct RegistryKeys {
    prefix: String,
}

impl RegistryKeys {
    fn agent(&self, id: &AgentId) -> String {
        format!("{}:agent:{}", self.prefix, id)
    }

    fn agent_log(&self, id: &AgentId) -> String {
        format!("{}:agent-log:{}", self.prefix, id)
    }

    fn controller(&self, name: &str) -> String {
        format!("{}:controller:{}", self.prefix, name)
    }

    fn all_agents(&self) -> String {
        format!("{}:agents", self.prefix)
    }

    fn lock(&self, id: &AgentId) -> String {
        format!("{}:lock:agent:{}", self.prefix, id)
    }

    fn namespace(&self) -> String {
        format!("{}:", self.prefix)
    }
}

#[derive(Clone)]
pub struct AgentRegistry {
    kv: Arc<dyn KeyValueStore>,
    lock: Arc<dyn DistributedLock>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
    keys: RegistryKeys,
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("kv", &self.kv)
            .field("config", &self.config)
            .finish()
    }
}

impl AgentRegistry {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        lock: Arc<dyn DistributedLock>,
        clock: Arc<dyn Clock>,
        config: RegistryConfig,
    ) -> Self {
        let keys = RegistryKeys {
            prefix: config.key_prefix.clone(),
        };
        Self {
            kv,
            lock,
            clock,
            config,
            keys,
        }
    }

    /// Builds a registry whose store and lock share one backend.
    pub fn with_backend<B>(
        backend: Arc<B>,
        clock: Arc<dyn Clock>,
        config: RegistryConfig,
    ) -> Self
    where
        B: KeyValueStore + DistributedLock + 'static,
    {
        let kv: Arc<dyn KeyValueStore> = backend.clone();
        let lock: Arc<dyn DistributedLock> = backend;
        Self::new(kv, lock, clock, config)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Upserts the agent, re-indexes its capabilities and resets its
    /// heartbeat. The log telemetry entry is moved to its own key.
    pub async fn register_agent(&self, mut handle: AgentHandle) -> Result<()> {
        let agent_id = handle.agent_id.clone();
        let log = handle.take_log();
        let now = self.clock.now();

        with_lock(
            self.lock.as_ref(),
            &self.keys.lock(&agent_id),
            self.config.lock_ttl(),
            self.lock_retry(),
            || async {
                let previous = self.load_record(&agent_id).await?;
                let last_heartbeat = previous
                    .as_ref()
                    .map_or(now, |prev| prev.last_heartbeat.max(now));
                let record = RegisteredAgent::new(handle, last_heartbeat);

                self.write_record(&record, log.as_deref()).await?;

                let id = agent_id.as_str();
                for name in &record.handle.controller_names {
                    let key = self.keys.controller(name);
                    self.kv.hset(&key, id, id).await?;
                    self.kv.expire(&key, self.config.retention()).await?;
                }
                let all = self.keys.all_agents();
                self.kv.hset(&all, id, id).await?;
                self.kv.expire(&all, self.config.retention()).await?;

                if let Some(prev) = previous {
                    let dropped: BTreeSet<&String> = prev
                        .handle
                        .controller_names
                        .difference(&record.handle.controller_names)
                        .collect();
                    for name in dropped {
                        self.kv.hdel(&self.keys.controller(name), id).await?;
                    }
                }
                Ok(())
            },
        )
        .await?;

        info!(agent = %agent_id, "agent registered");
        Ok(())
    }

    /// Extends liveness and replaces telemetry without touching the
    /// capability indices. Falls back to a full registration when the record
    /// has already lapsed from the backend.
    ///
    /// Runs under the same agent lock as [`register_agent`](Self::register_agent)
    /// so a refresh never writes back a record older than a concurrent
    /// registration.
    pub async fn refresh_heartbeat_and_telemetry(
        &self,
        handle: AgentHandle,
    ) -> Result<()> {
        let agent_id = handle.agent_id.clone();
        let mut telemetry = handle.clone();
        let log = telemetry.take_log();
        let now = self.clock.now();

        let refreshed = with_lock(
            self.lock.as_ref(),
            &self.keys.lock(&agent_id),
            self.config.lock_ttl(),
            self.lock_retry(),
            || async {
                let Some(mut record) = self.load_record(&agent_id).await? else {
                    return Ok(None);
                };

                record.handle.telemetry = telemetry.telemetry;
                record.last_heartbeat = record.last_heartbeat.max(now);
                self.write_record(&record, log.as_deref()).await?;

                let retention = self.config.retention();
                let id = agent_id.as_str();
                for name in &record.handle.controller_names {
                    self.kv.expire(&self.keys.controller(name), retention).await?;
                }
                let all = self.keys.all_agents();
                if !self.kv.expire(&all, retention).await? {
                    self.kv.hset(&all, id, id).await?;
                    self.kv.expire(&all, retention).await?;
                }
                Ok(Some(record.last_heartbeat))
            },
        )
        .await?;

        match refreshed {
            Some(at) => {
                debug!(agent = %agent_id, at = %at, "agent heartbeat");
                Ok(())
            }
            None => {
                debug!(agent = %agent_id, "no registry record; re-registering");
                self.register_agent(handle).await
            }
        }
    }

    /// Full record including the split-out log, or `None` once expired.
    pub async fn get_agent_by_id(
        &self,
        agent_id: &AgentId,
    ) -> Result<Option<RegisteredAgent>> {
        let Some(mut record) = self.load_record(agent_id).await? else {
            return Ok(None);
        };
        if record.is_expired(self.clock.now(), self.config.agent_timeout()) {
            return Ok(None);
        }
        if let Some(log) = self.kv.get(&self.keys.agent_log(agent_id)).await? {
            record
                .handle
                .telemetry
                .insert(LOG_TELEMETRY_KEY.to_string(), log);
        }
        Ok(Some(record))
    }

    /// Live agents able to run `controller_name`, ordered by id.
    pub async fn get_agents_by_controller_name(
        &self,
        controller_name: &str,
    ) -> Result<Vec<RegisteredAgent>> {
        let index = self.keys.controller(controller_name);
        let ids = self.kv.hgetall(&index).await?;
        let now = self.clock.now();
        let ttl = self.config.agent_timeout();

        let mut agents = Vec::with_capacity(ids.len());
        for raw_id in ids.keys() {
            let agent_id = AgentId::new(raw_id.as_str());
            match self.load_record(&agent_id).await? {
                Some(record) if record.handle.can_run(controller_name) => {
                    if !record.is_expired(now, ttl) {
                        agents.push(record);
                    }
                }
                _ => {
                    // Lapsed record or the capability was withdrawn.
                    self.kv.hdel(&index, raw_id).await?;
                }
            }
        }
        agents.sort_by(|a, b| a.agent_id().cmp(b.agent_id()));
        Ok(agents)
    }

    /// Every agent in the directory. Expired agents are included only when
    /// `include_expired` is set and their keys are still retained.
    pub async fn get_all_agents(
        &self,
        include_expired: bool,
    ) -> Result<Vec<RegisteredAgent>> {
        let index = self.keys.all_agents();
        let ids = self.kv.hgetall(&index).await?;
        let now = self.clock.now();
        let ttl = self.config.agent_timeout();

        let mut agents = Vec::with_capacity(ids.len());
        for raw_id in ids.keys() {
            match self.load_record(&AgentId::new(raw_id.as_str())).await? {
                Some(record) => {
                    if include_expired || !record.is_expired(now, ttl) {
                        agents.push(record);
                    }
                }
                None => self.kv.hdel(&index, raw_id).await?,
            }
        }
        agents.sort_by(|a, b| a.agent_id().cmp(b.agent_id()));
        Ok(agents)
    }

    /// Removes every registry key under the prefix. Returns how many went.
    pub async fn clear_all(&self) -> Result<usize> {
        let keys = self.kv.keys(&self.keys.namespace()).await?;
        for key in &keys {
            self.kv.delete(key).await?;
        }
        info!(removed = keys.len(), "agent registry cleared");
        Ok(keys.len())
    }

    fn lock_retry(&self) -> LockRetry {
        LockRetry {
            attempts: self.config.lock_retry_attempts,
            delay: self.config.lock_retry_delay(),
        }
    }

    async fn load_record(
        &self,
        agent_id: &AgentId,
    ) -> Result<Option<RegisteredAgent>> {
        match self.kv.get(&self.keys.agent(agent_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn write_record(
        &self,
        record: &RegisteredAgent,
        log: Option<&str>,
    ) -> Result<()> {
        let retention = Some(self.config.retention());
        let json = serde_json::to_string(record)?;
        self.kv
            .set(&self.keys.agent(record.agent_id()), &json, retention)
            .await?;
        let log_key = self.keys.agent_log(record.agent_id());
        match log {
            Some(log) => self.kv.set(&log_key, log, retention).await?,
            None => {
                self.kv.expire(&log_key, self.config.retention()).await?;
            }
        }
        Ok(())
    }
}
