//! Short-lived cache of credential records keyed by secret hash.
//!
//! The cache only ever saves a store round-trip. Revocation removes the entry
//! synchronously, and every cache error falls back to the metadata store.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::models::Credential;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Cache command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid cache entry: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

#[async_trait]
pub trait CredentialCache: Send + Sync {
    async fn get(&self, secret_hash: &str) -> CacheResult<Option<Credential>>;

    async fn put(&self, credential: &Credential, ttl: Duration) -> CacheResult<()>;

    async fn invalidate(&self, secret_hash: &str) -> CacheResult<()>;
}

fn cache_key(secret_hash: &str) -> String {
    format!("gateway:credential:{}", secret_hash)
}

/// Redis-backed cache shared by every gateway instance
#[derive(Clone)]
pub struct RedisCredentialCache {
    redis: ConnectionManager,
    command_timeout: Duration,
}

impl RedisCredentialCache {
    pub fn new(redis: ConnectionManager, command_timeout: Duration) -> Self {
        Self {
            redis,
            command_timeout,
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> CacheResult<T> {
        tokio::time::timeout(self.command_timeout, fut)
            .await
            .map_err(|_| CacheError::Timeout(self.command_timeout))?
            .map_err(CacheError::from)
    }
}

#[async_trait]
impl CredentialCache for RedisCredentialCache {
    async fn get(&self, secret_hash: &str) -> CacheResult<Option<Credential>> {
        let mut conn = self.redis.clone();
        let key = cache_key(secret_hash);

        let value: Option<String> = self.bounded(conn.get(&key)).await?;
        match value {
            Some(v) => Ok(Some(serde_json::from_str(&v)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, credential: &Credential, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.redis.clone();
        let key = cache_key(&credential.secret_hash);
        let value = serde_json::to_string(credential)?;
        let ttl_secs = ttl.as_secs().max(1);

        self.bounded(conn.set_ex::<_, _, ()>(&key, value, ttl_secs))
            .await
    }

    async fn invalidate(&self, secret_hash: &str) -> CacheResult<()> {
        let mut conn = self.redis.clone();
        let key = cache_key(secret_hash);

        self.bounded(conn.del::<_, ()>(&key)).await
    }
}

/// Process-local cache for single-instance deployments
#[derive(Debug, Default)]
pub struct InMemoryCredentialCache {
    entries: Mutex<HashMap<String, (Credential, Instant)>>,
}

impl InMemoryCredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Credential, Instant)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CredentialCache for InMemoryCredentialCache {
    async fn get(&self, secret_hash: &str) -> CacheResult<Option<Credential>> {
        let mut entries = self.entries();
        match entries.get(secret_hash) {
            Some((credential, expires_at)) if *expires_at > Instant::now() => {
                Ok(Some(credential.clone()))
            }
            Some(_) => {
                entries.remove(secret_hash);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, credential: &Credential, ttl: Duration) -> CacheResult<()> {
        self.entries().insert(
            credential.secret_hash.clone(),
            (credential.clone(), Instant::now() + ttl),
        );
        Ok(())
    }

    async fn invalidate(&self, secret_hash: &str) -> CacheResult<()> {
        self.entries().remove(secret_hash);
        Ok(())
    }
}

/// Cache that never holds anything; every lookup goes to the store
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCredentialCache;

#[async_trait]
impl CredentialCache for NoopCredentialCache {
    async fn get(&self, _secret_hash: &str) -> CacheResult<Option<Credential>> {
        Ok(None)
    }

    async fn put(&self, _credential: &Credential, _ttl: Duration) -> CacheResult<()> {
        Ok(())
    }

    async fn invalidate(&self, _secret_hash: &str) -> CacheResult<()> {
        Ok(())
    }
}

/// Pick the cache for a deployment: Redis when connected, otherwise local.
pub fn credential_cache(
    redis: Option<ConnectionManager>,
    command_timeout: Duration,
) -> Arc<dyn CredentialCache> {
    match redis {
        Some(redis) => Arc::new(RedisCredentialCache::new(redis, command_timeout)),
        None => Arc::new(InMemoryCredentialCache::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CredentialStatus, Permission};
    use chrono::Utc;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn credential() -> Credential {
        Credential {
            id: Uuid::new_v4(),
            tenant: "acme".into(),
            name: "ci".into(),
            secret_hash: "abc".into(),
            permissions: BTreeSet::from([Permission::Read]),
            scope: None,
            status: CredentialStatus::Active,
            created_at: Utc::now(),
            revoked_at: None,
            last_used_at: None,
            version: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_entries_expire() {
        let cache = InMemoryCredentialCache::new();
        cache.put(&credential(), Duration::from_secs(5)).await.unwrap();
        assert!(cache.get("abc").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_invalidate() {
        let cache = InMemoryCredentialCache::new();
        cache.put(&credential(), Duration::from_secs(60)).await.unwrap();
        cache.invalidate("abc").await.unwrap();
        assert!(cache.get("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_noop_never_hits() {
        let cache = NoopCredentialCache;
        cache.put(&credential(), Duration::from_secs(60)).await.unwrap();
        assert!(cache.get("abc").await.unwrap().is_none());
    }
}
