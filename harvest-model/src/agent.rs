use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use chrono::{DateTime, Duration, Utc};

use crate::{
    error::ParseError,
    ids::{AgentId, TenantId},
};

/// Telemetry entry that holds free-form worker logs. It is stored apart from
/// the discovery record so capability lookups stay small.
pub const LOG_TELEMETRY_KEY: &str = "log";

/// Deployment category of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum AgentType {
    /// Worker running inside the central deployment.
    #[default]
    Default,
    /// Worker running on customer premises next to the data source.
    Satellite,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Default => "default",
            AgentType::Satellite => "satellite",
        }
    }

    /// Case-insensitive parse, tolerant of surrounding whitespace.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(AgentType::Default),
            "satellite" => Ok(AgentType::Satellite),
            _ => Err(ParseError::new("agent type", raw)),
        }
    }
}

impl FromStr for AgentType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and capability snapshot announced by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AgentHandle {
    pub agent_id: AgentId,
    pub agent_type: AgentType,
    /// Job kinds this agent is able to execute.
    #[cfg_attr(feature = "serde", serde(default))]
    pub controller_names: BTreeSet<String>,
    /// Data sources owned by this agent.
    #[cfg_attr(feature = "serde", serde(default))]
    pub integration_ids: BTreeSet<String>,
    pub tenant_id: TenantId,
    #[cfg_attr(feature = "serde", serde(default))]
    pub telemetry: BTreeMap<String, String>,
}

impl AgentHandle {
    pub fn new(
        agent_id: impl Into<AgentId>,
        agent_type: AgentType,
        tenant_id: impl Into<TenantId>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type,
            controller_names: BTreeSet::new(),
            integration_ids: BTreeSet::new(),
            tenant_id: tenant_id.into(),
            telemetry: BTreeMap::new(),
        }
    }

    pub fn with_controllers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.controller_names
            .extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_integrations<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.integration_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_telemetry(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.telemetry.insert(key.into(), value.into());
        self
    }

    pub fn can_run(&self, controller_name: &str) -> bool {
        self.controller_names.contains(controller_name)
    }

    /// Removes the log entry from telemetry and returns it.
    pub fn take_log(&mut self) -> Option<String> {
        self.telemetry.remove(LOG_TELEMETRY_KEY)
    }

    pub fn log(&self) -> Option<&str> {
        self.telemetry.get(LOG_TELEMETRY_KEY).map(String::as_str)
    }
}

/// Agent handle plus the instant it last proved liveness.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegisteredAgent {
    pub handle: AgentHandle,
    pub last_heartbeat: DateTime<Utc>,
}

impl RegisteredAgent {
    pub fn new(handle: AgentHandle, last_heartbeat: DateTime<Utc>) -> Self {
        Self {
            handle,
            last_heartbeat,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.handle.agent_id
    }

    /// An agent is expired once strictly more than `ttl` has elapsed since
    /// its last heartbeat.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.last_heartbeat > ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_type_parse_is_case_insensitive() {
        assert_eq!(AgentType::parse("SATELLITE").unwrap(), AgentType::Satellite);
        assert_eq!(AgentType::parse(" Default ").unwrap(), AgentType::Default);
        assert!(AgentType::parse("edge").is_err());
    }

    #[test]
    fn expiry_is_strictly_after_ttl() {
        let now = Utc::now();
        let agent = RegisteredAgent::new(
            AgentHandle::new("a-1", AgentType::Default, "t"),
            now - Duration::seconds(30),
        );
        assert!(!agent.is_expired(now, Duration::seconds(30)));
        assert!(agent.is_expired(now, Duration::seconds(29)));
    }

    #[test]
    fn take_log_strips_only_the_log_entry() {
        let mut handle = AgentHandle::new("a-1", AgentType::Default, "t")
            .with_telemetry(LOG_TELEMETRY_KEY, "boot ok")
            .with_telemetry("version", "1.2.0");

        assert_eq!(handle.take_log().as_deref(), Some("boot ok"));
        assert!(handle.log().is_none());
        assert_eq!(handle.telemetry.get("version").map(String::as_str), Some("1.2.0"));
    }
}
