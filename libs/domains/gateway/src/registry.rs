//! Tenant → database → table → engine handle bookkeeping.
//!
//! The metadata store is the source of truth; the in-process map is a cache
//! validated against the stored `version` on every resolve.
//!
//! Create and drop of one path are serialized twice over: in-process by a
//! per-path lock, and across processes by compare-and-set on the stored
//! record. Table mutations hold their database's lock shared and the table
//! lock exclusively, so a database cannot be dropped while a table inside it
//! is being created. Unrelated paths never wait on each other.
//!
//! A `creating` record whose creator could not settle it (the store failed
//! after the engine call, or the process died) is abandoned. The next create
//! or drop of that path settles it by repeating the engine create, which is
//! idempotent per namespace, and finishing the transition to `ready`.

use chrono::Utc;
use database::common::RetryConfig;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock as AsyncRwLock};

use crate::engine::StorageEngine;
use crate::error::{GatewayError, GatewayResult};
use crate::models::{EngineHandle, ResourceConfig, ResourceHandle, ResourceKey, ResourceState};
use crate::store::{MetadataStore, with_retry};

type PathLock = Arc<AsyncRwLock<()>>;

const DEFAULT_CREATING_LEASE: Duration = Duration::from_secs(120);

/// Locks held for the duration of one create or drop
struct PathGuard {
    _parent: Option<OwnedRwLockReadGuard<()>>,
    _path: OwnedRwLockWriteGuard<()>,
}

/// Result of [`ResourceRegistry::create`]
#[derive(Debug, Clone)]
pub struct Created {
    pub handle: ResourceHandle,
    /// False when an identical resource already existed
    pub created: bool,
}

#[derive(Clone)]
pub struct ResourceRegistry {
    inner: Arc<Inner>,
    creating_lease: Duration,
}

struct Inner {
    store: Arc<dyn MetadataStore>,
    engine: Arc<dyn StorageEngine>,
    retry: RetryConfig,
    cache: RwLock<HashMap<ResourceKey, ResourceHandle>>,
    locks: Mutex<HashMap<ResourceKey, Weak<AsyncRwLock<()>>>>,
    /// `creating` records this instance wrote but failed to settle
    unsettled: Mutex<HashSet<ResourceKey>>,
}

fn not_found(key: &ResourceKey) -> GatewayError {
    let kind = if key.path.is_table() { "table" } else { "database" };
    GatewayError::NotFound(format!("{} '{}' not found", kind, key.path))
}

impl ResourceRegistry {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        engine: Arc<dyn StorageEngine>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                engine,
                retry,
                cache: RwLock::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                unsettled: Mutex::new(HashSet::new()),
            }),
            creating_lease: DEFAULT_CREATING_LEASE,
        }
    }

    /// How long another instance's `creating` record is trusted to be in flight.
    pub fn with_creating_lease(mut self, lease: Duration) -> Self {
        self.creating_lease = lease;
        self
    }

    fn path_lock(&self, key: &ResourceKey) -> PathLock {
        let mut locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(key).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(AsyncRwLock::new(()));
        locks.insert(key.clone(), Arc::downgrade(&lock));
        lock
    }

    async fn lock_path(&self, key: &ResourceKey) -> PathGuard {
        let parent = match key.parent() {
            Some(parent) => Some(self.path_lock(&parent).read_owned().await),
            None => None,
        };
        PathGuard {
            _parent: parent,
            _path: self.path_lock(key).write_owned().await,
        }
    }

    fn cached(&self, key: &ResourceKey) -> Option<ResourceHandle> {
        let cache = self.inner.cache.read().unwrap_or_else(PoisonError::into_inner);
        cache.get(key).cloned()
    }

    fn cache_put(&self, handle: &ResourceHandle) {
        let mut cache = self.inner.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.insert(handle.key(), handle.clone());
    }

    fn cache_evict(&self, key: &ResourceKey) {
        let mut cache = self.inner.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.remove(key);
    }

    fn mark_unsettled(&self, key: &ResourceKey, settled: bool) {
        let mut unsettled = self
            .inner
            .unsettled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if settled {
            unsettled.remove(key);
        } else {
            unsettled.insert(key.clone());
        }
    }

    /// True for a `creating` record nobody will finish: one this instance
    /// gave up on, or one older than the lease. Callers hold the path lock.
    fn is_abandoned(&self, record: &ResourceHandle) -> bool {
        if record.state != ResourceState::Creating {
            return false;
        }
        let local = self
            .inner
            .unsettled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&record.key());
        local
            || (Utc::now() - record.updated_at)
                .to_std()
                .is_ok_and(|age| age >= self.creating_lease)
    }

    async fn load(&self, key: &ResourceKey) -> GatewayResult<Option<ResourceHandle>> {
        Ok(with_retry(&self.inner.retry, || self.inner.store.find_resource(key)).await?)
    }

    /// A ready handle for `key`, served from cache when its version is current.
    pub async fn resolve(&self, key: &ResourceKey) -> GatewayResult<ResourceHandle> {
        let Some(version) =
            with_retry(&self.inner.retry, || self.inner.store.resource_version(key)).await?
        else {
            self.cache_evict(key);
            return Err(not_found(key));
        };

        if let Some(handle) = self.cached(key) {
            if handle.version == version && handle.is_ready() {
                return Ok(handle);
            }
        }

        match self.load(key).await? {
            Some(handle) if handle.is_ready() => {
                tracing::debug!(resource = %key, version = handle.version, "Refreshed resource handle");
                self.cache_put(&handle);
                Ok(handle)
            }
            Some(handle) => {
                self.cache_evict(key);
                Err(GatewayError::NotFound(format!(
                    "'{}' is {}",
                    key.path, handle.state
                )))
            }
            None => {
                self.cache_evict(key);
                Err(not_found(key))
            }
        }
    }

    /// Create a database or table.
    ///
    /// The record is written as `creating` before the engine is called, and
    /// removed again if the engine fails so the create can be retried.
    pub async fn create(
        &self,
        key: &ResourceKey,
        config: ResourceConfig,
    ) -> GatewayResult<Created> {
        match (&config, key.path.is_table()) {
            (ResourceConfig::Table { .. }, true) | (ResourceConfig::Database { .. }, false) => {}
            _ => {
                return Err(GatewayError::Validation(format!(
                    "configuration does not match resource '{}'",
                    key.path
                )));
            }
        }

        let _guard = self.lock_path(key).await;

        if let Some(parent) = key.parent() {
            self.resolve(&parent).await?;
        }

        if let Some(existing) = self.load(key).await? {
            if self.is_abandoned(&existing) {
                let settled = self.settle(key, existing).await?;
                if settled.config == config {
                    return Ok(Created {
                        handle: settled,
                        created: true,
                    });
                }
                return self.existing(settled, &config);
            }
            return self.existing(existing, &config);
        }

        let record = ResourceHandle::creating(key, config.clone());
        let inserted =
            with_retry(&self.inner.retry, || self.inner.store.insert_resource(&record)).await?;
        if !inserted {
            // Another gateway instance won the compare-and-set.
            return match self.load(key).await? {
                Some(existing) => self.existing(existing, &config),
                None => Err(GatewayError::Conflict(format!(
                    "'{}' is being modified concurrently",
                    key.path
                ))),
            };
        }

        let namespace = key.engine_namespace();
        let engine_handle = match self.inner.engine.create_resource(&namespace, &config).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(resource = %key, error = %e, "Engine create failed");
                let removed = with_retry(&self.inner.retry, || {
                    self.inner.store.delete_resource(key, record.version)
                })
                .await;
                if let Err(store_err) = removed {
                    tracing::error!(resource = %key, error = %store_err, "Failed to remove creating record after engine failure");
                    self.mark_unsettled(key, false);
                }
                return Err(GatewayError::EngineFailure(e));
            }
        };

        let ready = self.finish_create(key, &record, engine_handle).await?;
        tracing::info!(resource = %key, namespace = %namespace, "Created resource");
        Ok(Created {
            handle: ready,
            created: true,
        })
    }

    /// Move `record` from `creating` to `ready`. On a store failure the
    /// record stays `creating` and is remembered as unsettled.
    async fn finish_create(
        &self,
        key: &ResourceKey,
        record: &ResourceHandle,
        engine_handle: EngineHandle,
    ) -> GatewayResult<ResourceHandle> {
        let mut ready = record.transition(ResourceState::Ready);
        ready.engine_handle = Some(engine_handle);
        let updated = match with_retry(&self.inner.retry, || {
            self.inner.store.update_resource(&ready, record.version)
        })
        .await
        {
            Ok(updated) => updated,
            Err(e) => {
                tracing::error!(resource = %key, error = %e, "Engine resource exists but the ready write failed");
                self.mark_unsettled(key, false);
                return Err(e.into());
            }
        };
        self.mark_unsettled(key, true);
        if !updated {
            tracing::error!(resource = %key, "Creating record changed while the engine call ran");
            return Err(GatewayError::Conflict(format!(
                "'{}' was modified concurrently",
                key.path
            )));
        }

        self.cache_put(&ready);
        Ok(ready)
    }

    /// Finish an abandoned `creating` record.
    async fn settle(&self, key: &ResourceKey, stale: ResourceHandle) -> GatewayResult<ResourceHandle> {
        tracing::warn!(resource = %key, version = stale.version, "Settling abandoned creating record");
        let engine_handle = self
            .inner
            .engine
            .create_resource(&key.engine_namespace(), &stale.config)
            .await
            .map_err(|e| {
                tracing::error!(resource = %key, error = %e, "Engine create failed while settling");
                GatewayError::EngineFailure(e)
            })?;
        self.finish_create(key, &stale, engine_handle).await
    }

    fn existing(&self, existing: ResourceHandle, config: &ResourceConfig) -> GatewayResult<Created> {
        match existing.state {
            ResourceState::Ready if existing.config == *config => Ok(Created {
                handle: existing,
                created: false,
            }),
            ResourceState::Ready => Err(GatewayError::Conflict(format!(
                "'{}' already exists with a different configuration",
                existing.path
            ))),
            state => Err(GatewayError::Conflict(format!(
                "'{}' is {}",
                existing.path, state
            ))),
        }
    }

    /// Drop a database or table.
    ///
    /// A failed engine call leaves the record in `dropping`; calling drop again
    /// retries the engine side.
    pub async fn drop(&self, key: &ResourceKey) -> GatewayResult<()> {
        let _guard = self.lock_path(key).await;

        let mut current = self.load(key).await?.ok_or_else(|| not_found(key))?;
        if self.is_abandoned(&current) {
            current = self.settle(key, current).await?;
        }
        let dropping = match current.state {
            ResourceState::Ready => {
                if !key.path.is_table() {
                    let tables = with_retry(&self.inner.retry, || {
                        self.inner
                            .store
                            .list_resources(&key.tenant, Some(&key.path.database))
                    })
                    .await?;
                    if !tables.is_empty() {
                        return Err(GatewayError::Conflict(format!(
                            "database '{}' still has {} table(s)",
                            key.path,
                            tables.len()
                        )));
                    }
                }

                let dropping = current.transition(ResourceState::Dropping);
                let updated = with_retry(&self.inner.retry, || {
                    self.inner.store.update_resource(&dropping, current.version)
                })
                .await?;
                if !updated {
                    return Err(GatewayError::Conflict(format!(
                        "'{}' was modified concurrently",
                        key.path
                    )));
                }
                dropping
            }
            ResourceState::Dropping => {
                tracing::warn!(resource = %key, "Retrying drop of resource left in dropping");
                current
            }
            state => {
                return Err(GatewayError::Conflict(format!("'{}' is {}", key.path, state)));
            }
        };
        self.cache_evict(key);

        if let Some(engine_handle) = &dropping.engine_handle {
            if let Err(e) = self.inner.engine.drop_resource(engine_handle).await {
                tracing::error!(resource = %key, error = %e, "Engine drop failed; resource left in dropping");
                return Err(GatewayError::EngineFailure(e));
            }
        }

        let deleted = with_retry(&self.inner.retry, || {
            self.inner.store.delete_resource(key, dropping.version)
        })
        .await?;
        if !deleted {
            tracing::warn!(resource = %key, "Dropping record changed before removal");
        }

        tracing::info!(resource = %key, "Dropped resource");
        Ok(())
    }

    /// Databases of `tenant`, or tables of `database`.
    pub async fn list(
        &self,
        tenant: &str,
        database: Option<&str>,
    ) -> GatewayResult<Vec<ResourceHandle>> {
        Ok(with_retry(&self.inner.retry, || {
            self.inner.store.list_resources(tenant, database)
        })
        .await?)
    }

    /// Version held in the local cache, if any.
    pub fn cached_version(&self, key: &ResourceKey) -> Option<i64> {
        self.cached(key).map(|h| h.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, MockStorageEngine};
    use crate::error::ErrorKind;
    use crate::models::{DistanceMetric, EngineHandle};
    use crate::store::InMemoryMetadataStore;

    fn key(path: &str) -> ResourceKey {
        ResourceKey::new("acme", path.parse().unwrap())
    }

    fn registry(engine: MockStorageEngine) -> (ResourceRegistry, Arc<InMemoryMetadataStore>) {
        let store = Arc::new(InMemoryMetadataStore::new());
        let registry = ResourceRegistry::new(
            store.clone(),
            Arc::new(engine),
            RetryConfig::new().with_max_retries(0),
        );
        (registry, store)
    }

    fn database() -> ResourceConfig {
        ResourceConfig::Database { description: None }
    }

    #[tokio::test]
    async fn test_engine_failure_removes_record() {
        let mut engine = MockStorageEngine::new();
        engine
            .expect_create_resource()
            .times(1)
            .returning(|_, _| Err(EngineError::Unavailable("down".into())));
        engine
            .expect_create_resource()
            .times(1)
            .returning(|ns, _| Ok(EngineHandle(ns.to_string())));

        let (registry, store) = registry(engine);

        let err = registry.create(&key("db1"), database()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineFailure);
        assert!(store.find_resource(&key("db1")).await.unwrap().is_none());

        // retry is possible
        let created = registry.create(&key("db1"), database()).await.unwrap();
        assert!(created.created);
        assert_eq!(created.handle.state, ResourceState::Ready);
    }

    #[tokio::test]
    async fn test_engine_drop_failure_leaves_dropping() {
        let mut engine = MockStorageEngine::new();
        engine
            .expect_create_resource()
            .returning(|ns, _| Ok(EngineHandle(ns.to_string())));
        engine
            .expect_drop_resource()
            .times(1)
            .returning(|_| Err(EngineError::Unavailable("down".into())));
        engine.expect_drop_resource().times(1).returning(|_| Ok(()));

        let (registry, store) = registry(engine);
        registry.create(&key("db1"), database()).await.unwrap();

        let err = registry.drop(&key("db1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineFailure);
        let stuck = store.find_resource(&key("db1")).await.unwrap().unwrap();
        assert_eq!(stuck.state, ResourceState::Dropping);

        // not resolvable while dropping
        let err = registry.resolve(&key("db1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        registry.drop(&key("db1")).await.unwrap();
        assert!(store.find_resource(&key("db1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_table_requires_ready_database() {
        let mut engine = MockStorageEngine::new();
        engine.expect_create_resource().never();
        let (registry, _) = registry(engine);

        let err = registry
            .create(
                &key("db1/t"),
                ResourceConfig::Table {
                    dimension: 3,
                    metric: DistanceMetric::Cosine,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_config_kind_must_match_path() {
        let mut engine = MockStorageEngine::new();
        engine.expect_create_resource().never();
        let (registry, _) = registry(engine);

        let err = registry.create(&key("db1/t"), database()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_resolve_refreshes_stale_cache() {
        let mut engine = MockStorageEngine::new();
        engine
            .expect_create_resource()
            .returning(|ns, _| Ok(EngineHandle(ns.to_string())));
        let (registry, store) = registry(engine);

        let created = registry.create(&key("db1"), database()).await.unwrap();
        assert_eq!(registry.cached_version(&key("db1")), Some(created.handle.version));

        // another instance bumps the record
        let bumped = created.handle.transition(ResourceState::Ready);
        assert!(store.update_resource(&bumped, created.handle.version).await.unwrap());

        let resolved = registry.resolve(&key("db1")).await.unwrap();
        assert_eq!(resolved.version, bumped.version);
        assert_eq!(registry.cached_version(&key("db1")), Some(bumped.version));
    }
}
