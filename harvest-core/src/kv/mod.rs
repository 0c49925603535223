//! Key-value backend and narrow distributed lock used by the agent registry.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

use std::{collections::BTreeMap, fmt, future::Future, time::Duration};

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::error::{HarvestError, Result};

pub use memory::InMemoryKeyValueStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisKeyValueStore;

/// Minimal string/hash store the registry is written against.
#[async_trait]
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Overwrites `key`. `ttl = None` keeps the value until deleted.
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>>;

    /// Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Advisory lock keyed by resource name. `token` identifies the holder so
/// that only the holder can release.
#[async_trait]
pub trait DistributedLock: Send + Sync + fmt::Debug {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool>;

    async fn release(&self, key: &str, token: &str) -> Result<bool>;
}

/// Acquisition policy for [`with_lock`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for LockRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(50),
        }
    }
}

/// Runs `f` while holding the lock on `key`.
///
/// The lock is released whether `f` succeeds or not. When the lock cannot be
/// taken within `retry.attempts` tries, `LockContention` is returned and `f`
/// never runs.
pub async fn with_lock<L, F, Fut, T>(
    lock: &L,
    key: &str,
    ttl: Duration,
    retry: LockRetry,
    f: F,
) -> Result<T>
where
    L: DistributedLock + ?Sized,
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
    T: Send,
{
    let token = Uuid::new_v4().to_string();
    let attempts = retry.attempts.max(1);

    let mut acquired = false;
    for attempt in 0..attempts {
        if lock.try_acquire(key, &token, ttl).await? {
            acquired = true;
            break;
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(retry.delay).await;
        }
    }
    if !acquired {
        return Err(HarvestError::LockContention(key.to_string()));
    }

    let outcome = f().await;

    match lock.release(key, &token).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(lock = key, "lock expired before release; ttl too short?");
        }
        Err(err) => {
            warn!(lock = key, error = %err, "failed to release lock");
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn with_lock_reports_contention_without_running_body() {
        let store = InMemoryKeyValueStore::new(Arc::new(ManualClock::new(Utc::now())));
        assert!(
            store
                .try_acquire("lock:agent:a", "other", Duration::from_secs(30))
                .await
                .unwrap()
        );

        let retry = LockRetry {
            attempts: 2,
            delay: Duration::from_millis(1),
        };
        let ran = std::sync::atomic::AtomicBool::new(false);
        let err = with_lock(&store, "lock:agent:a", Duration::from_secs(5), retry, || async {
            ran.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, HarvestError::LockContention(_)));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn with_lock_releases_after_body_error() {
        let store = InMemoryKeyValueStore::new(Arc::new(ManualClock::new(Utc::now())));
        let result: Result<()> = with_lock(
            &store,
            "lock:agent:b",
            Duration::from_secs(5),
            LockRetry::default(),
            || async { Err(HarvestError::Internal("boom".into())) },
        )
        .await;
        assert!(result.is_err());
        assert!(
            store
                .try_acquire("lock:agent:b", "next", Duration::from_secs(5))
                .await
                .unwrap()
        );
    }
}
