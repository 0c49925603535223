use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::ids::{JobDefinitionId, TenantId, TriggerId};

/// Persistent per-integration schedule definition.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DbTrigger {
    pub id: TriggerId,
    pub integration_key: String,
    /// Selects the cursor strategy that owns `metadata`.
    pub trigger_type: String,
    pub tenant_id: TenantId,
    /// Template used for every job this trigger produces.
    pub job_definition_id: JobDefinitionId,
    pub controller_name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    pub metadata: TriggerMetadata,
}

/// Opaque key/value map owned by the trigger's cursor strategy.
///
/// Timestamps are written as RFC 3339 strings; integer values are read as
/// epoch seconds so older rows keep working.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct TriggerMetadata(Map<String, Value>);

impl TriggerMetadata {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn get_datetime(&self, key: &str) -> Option<DateTime<Utc>> {
        match self.0.get(key)? {
            Value::String(raw) => DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|parsed| parsed.with_timezone(&Utc)),
            Value::Number(num) => num
                .as_i64()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            _ => None,
        }
    }

    pub fn set_datetime(&mut self, key: &str, value: DateTime<Utc>) {
        self.0.insert(
            key.to_string(),
            Value::String(value.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
    }

    /// Reads a flag, accepting JSON booleans and the strings `"true"`/`"false"`.
    pub fn get_bool(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(raw)) => raw.trim().eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.0.insert(key.to_string(), Value::Bool(value));
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn set_str(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), Value::String(value.into()));
    }
}

impl From<Map<String, Value>> for TriggerMetadata {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}
