use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{DistributedLock, KeyValueStore};
use crate::{
    clock::Clock,
    error::{HarvestError, Result},
};

#[derive(Debug, Clone)]
enum Slot {
    Scalar(String),
    Hash(BTreeMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Option<DateTime<Utc>>,
}

/// Process-local backend for tests and single-node deployments without Redis.
///
/// Expiry follows the injected clock, so a `ManualClock` fully controls when
/// keys and locks lapse.
#[derive(Clone)]
pub struct InMemoryKeyValueStore {
    clock: Arc<dyn Clock>,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl fmt::Debug for InMemoryKeyValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .entries
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("InMemoryKeyValueStore")
            .field("clock", &self.clock)
            .field("entries", &len)
            .finish()
    }
}

impl InMemoryKeyValueStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn deadline(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| self.clock.now() + ttl)
    }

    fn purge_expired(&self, entries: &mut HashMap<String, Entry>) {
        let now = self.clock.now();
        entries.retain(|_, entry| entry.expires_at.is_none_or(|at| at > now));
    }
}

fn wrong_type(key: &str) -> HarvestError {
    HarvestError::KeyValue(format!(
        "WRONGTYPE operation against key {key} holding the wrong kind of value"
    ))
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries);
        match entries.get(key).map(|entry| &entry.slot) {
            None => Ok(None),
            Some(Slot::Scalar(value)) => Ok(Some(value.clone())),
            Some(Slot::Hash(_)) => Err(wrong_type(key)),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let expires_at = ttl.and_then(|ttl| self.deadline(ttl));
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Scalar(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Hash(BTreeMap::new()),
            expires_at: None,
        });
        match &mut entry.slot {
            Slot::Hash(map) => {
                map.insert(field.to_string(), value.to_string());
                Ok(())
            }
            Slot::Scalar(_) => Err(wrong_type(key)),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries);
        let now_empty = match entries.get_mut(key).map(|entry| &mut entry.slot) {
            None => return Ok(()),
            Some(Slot::Hash(map)) => {
                map.remove(field);
                map.is_empty()
            }
            Some(Slot::Scalar(_)) => return Err(wrong_type(key)),
        };
        // Redis drops hashes once their last field goes.
        if now_empty {
            entries.remove(key);
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>> {
        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries);
        match entries.get(key).map(|entry| &entry.slot) {
            None => Ok(BTreeMap::new()),
            Some(Slot::Hash(map)) => Ok(map.clone()),
            Some(Slot::Scalar(_)) => Err(wrong_type(key)),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let deadline = self.deadline(ttl);
        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = deadline;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries);
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl DistributedLock for InMemoryKeyValueStore {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let expires_at = self.deadline(ttl);
        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Scalar(token.to_string()),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries);
        let held_by_caller = matches!(
            entries.get(key).map(|entry| &entry.slot),
            Some(Slot::Scalar(holder)) if holder == token
        );
        if held_by_caller {
            entries.remove(key);
        }
        Ok(held_by_caller)
    }
}
