use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use redis::{AsyncCommands, Script, aio::ConnectionManager};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{DistributedLock, KeyValueStore};
use crate::error::{HarvestError, Result};

/// Deletes the lock only if it still carries the caller's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis backend for the registry. The connection is opened on first use,
/// so an unreachable server surfaces as a `KeyValue` error on each call
/// rather than at construction.
#[derive(Clone)]
pub struct RedisKeyValueStore {
    client: redis::Client,
    conn: Arc<OnceCell<ConnectionManager>>,
    release: Script,
}

impl fmt::Debug for RedisKeyValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisKeyValueStore")
            .field("connected", &self.conn.initialized())
            .finish()
    }
}

impl RedisKeyValueStore {
    /// Validates the URL without touching the network.
    pub fn lazy(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            HarvestError::KeyValue(format!("Failed to create Redis client: {e}"))
        })?;
        Ok(Self {
            client,
            conn: Arc::new(OnceCell::new()),
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                info!("Connecting to Redis registry backend");
                let conn = ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| {
                        HarvestError::KeyValue(format!("Failed to connect to Redis: {e}"))
                    })?;
                info!("Connected to Redis registry backend");
                Ok::<_, HarvestError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut conn = self.connection().await?;
        match ttl {
            Some(ttl) => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(millis(ttl))
                    .query_async::<()>(&mut conn)
                    .await?;
            }
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.hdel::<_, _, ()>(key, field).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>> {
        let mut conn = self.connection().await?;
        Ok(conn.hgetall::<_, BTreeMap<String, String>>(key).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let applied = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let pattern = format!("{prefix}*");
        let mut keys = conn.keys::<_, Vec<String>>(&pattern).await?;
        keys.sort();
        debug!(pattern = %pattern, count = keys.len(), "listed registry keys");
        Ok(keys)
    }
}

#[async_trait]
impl DistributedLock for RedisKeyValueStore {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.connection().await?;
        let reply = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async::<Option<String>>(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let deleted = self
            .release
            .key(key)
            .arg(token)
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazy_rejects_malformed_urls() {
        let err = RedisKeyValueStore::lazy("not a url").unwrap_err();
        assert!(matches!(err, HarvestError::KeyValue(_)));
    }

    #[tokio::test]
    async fn unreachable_server_fails_per_call() {
        let store = RedisKeyValueStore::lazy("redis://127.0.0.1:1/").unwrap();
        assert!(!store.conn.initialized());

        let err = tokio::time::timeout(Duration::from_secs(60), store.get("harvest:agents"))
            .await
            .expect("connection attempt gives up")
            .unwrap_err();
        assert!(matches!(err, HarvestError::KeyValue(_)));
        assert!(!store.conn.initialized());
    }
}
