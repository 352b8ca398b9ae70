//! Shared fixtures for the gateway integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain_gateway::engine::EngineResult;
use domain_gateway::models::{EngineHandle, InsertSummary, RowPage, SearchHit, SearchQuery};
use domain_gateway::store::StoreResult;
use domain_gateway::{
    CreateCredential, Credential, EngineError, Gateway, GatewayConfig, InMemoryCredentialCache,
    InMemoryEngine, InMemoryMetadataStore, MetadataStore, Permission, ResourceConfig,
    ResourceHandle, ResourceKey, ScopePattern, StorageEngine, StoreError, VectorRecord,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use uuid::Uuid;

pub const TENANT: &str = "acme";

/// In-memory engine that counts calls and can be slowed down or made to fail.
#[derive(Default)]
pub struct CountingEngine {
    pub inner: InMemoryEngine,
    pub creates: AtomicUsize,
    pub drops: AtomicUsize,
    pub searches: AtomicUsize,
    pub fail_next_create: AtomicBool,
    pub delay: Option<Duration>,
    /// Store taken down right after the next create call
    pub trip_store: Mutex<Option<Arc<FlakyStore>>>,
}

impl CountingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Engine whose next create takes `store` down before returning.
    pub fn tripping(store: Arc<FlakyStore>) -> Self {
        Self {
            trip_store: Mutex::new(Some(store)),
            ..Self::default()
        }
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl StorageEngine for CountingEngine {
    async fn create_resource(
        &self,
        namespace: &str,
        config: &ResourceConfig,
    ) -> EngineResult<EngineHandle> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let result = if self.fail_next_create.swap(false, Ordering::SeqCst) {
            Err(EngineError::Unavailable("engine offline".to_string()))
        } else {
            self.inner.create_resource(namespace, config).await
        };
        if let Some(store) = self.trip_store.lock().unwrap().take() {
            store.set_down(true);
        }
        result
    }

    async fn drop_resource(&self, handle: &EngineHandle) -> EngineResult<()> {
        self.drops.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.inner.drop_resource(handle).await
    }

    async fn insert(
        &self,
        handle: &EngineHandle,
        rows: Vec<VectorRecord>,
    ) -> EngineResult<InsertSummary> {
        self.inner.insert(handle, rows).await
    }

    async fn search(&self, handle: &EngineHandle, query: SearchQuery) -> EngineResult<Vec<SearchHit>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.inner.search(handle, query).await
    }

    async fn scan(&self, handle: &EngineHandle, offset: u64, limit: u32) -> EngineResult<RowPage> {
        self.inner.scan(handle, offset, limit).await
    }
}

/// Metadata store that fails every call with `Unavailable` while `down` is set.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryMetadataStore,
    pub down: AtomicBool,
    pub calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MetadataStore for FlakyStore {
    async fn insert_credential(&self, credential: &Credential) -> StoreResult<bool> {
        self.check()?;
        self.inner.insert_credential(credential).await
    }

    async fn find_credential_by_hash(&self, secret_hash: &str) -> StoreResult<Option<Credential>> {
        self.check()?;
        self.inner.find_credential_by_hash(secret_hash).await
    }

    async fn find_credential(&self, tenant: &str, id: Uuid) -> StoreResult<Option<Credential>> {
        self.check()?;
        self.inner.find_credential(tenant, id).await
    }

    async fn list_credentials(&self, tenant: &str) -> StoreResult<Vec<Credential>> {
        self.check()?;
        self.inner.list_credentials(tenant).await
    }

    async fn update_credential(
        &self,
        credential: &Credential,
        expected_version: i64,
    ) -> StoreResult<bool> {
        self.check()?;
        self.inner.update_credential(credential, expected_version).await
    }

    async fn touch_credential(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        self.check()?;
        self.inner.touch_credential(id, at).await
    }

    async fn count_credentials(&self, tenant: &str) -> StoreResult<u64> {
        self.check()?;
        self.inner.count_credentials(tenant).await
    }

    async fn insert_resource(&self, handle: &ResourceHandle) -> StoreResult<bool> {
        self.check()?;
        self.inner.insert_resource(handle).await
    }

    async fn find_resource(&self, key: &ResourceKey) -> StoreResult<Option<ResourceHandle>> {
        self.check()?;
        self.inner.find_resource(key).await
    }

    async fn resource_version(&self, key: &ResourceKey) -> StoreResult<Option<i64>> {
        self.check()?;
        self.inner.resource_version(key).await
    }

    async fn update_resource(
        &self,
        handle: &ResourceHandle,
        expected_version: i64,
    ) -> StoreResult<bool> {
        self.check()?;
        self.inner.update_resource(handle, expected_version).await
    }

    async fn delete_resource(&self, key: &ResourceKey, expected_version: i64) -> StoreResult<bool> {
        self.check()?;
        self.inner.delete_resource(key, expected_version).await
    }

    async fn list_resources(
        &self,
        tenant: &str,
        database: Option<&str>,
    ) -> StoreResult<Vec<ResourceHandle>> {
        self.check()?;
        self.inner.list_resources(tenant, database).await
    }
}

/// Collects `audit` events emitted on the current thread.
#[derive(Clone, Default)]
pub struct AuditLog(Arc<Mutex<Vec<(String, String)>>>);

impl AuditLog {
    /// Capture until the guard is dropped. Tasks spawned on a current-thread
    /// runtime are captured too.
    pub fn install(&self) -> DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    /// Outcomes recorded for `action`, oldest first.
    pub fn outcomes(&self, action: &str) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| a == action)
            .map(|(_, outcome)| outcome.clone())
            .collect()
    }
}

#[derive(Default)]
struct AuditFields {
    action: Option<String>,
    outcome: Option<String>,
}

impl Visit for AuditFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_debug(field, &value.to_string() as &dyn fmt::Debug);
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let text = format!("{:?}", value).trim_matches('"').to_string();
        match field.name() {
            "action" => self.action = Some(text),
            "outcome" => self.outcome = Some(text),
            _ => {}
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for AuditLog {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().target() != "audit" {
            return;
        }
        let mut fields = AuditFields::default();
        event.record(&mut fields);
        if let (Some(action), Some(outcome)) = (fields.action, fields.outcome) {
            self.0.lock().unwrap().push((action, outcome));
        }
    }
}

/// Config with fast store retries so outage tests finish quickly.
pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        store_retry_attempts: 2,
        ..GatewayConfig::default()
    }
}

pub struct TestGateway {
    pub gateway: Arc<Gateway>,
    pub engine: Arc<CountingEngine>,
    pub store: Arc<FlakyStore>,
    pub admin: String,
}

pub async fn setup() -> TestGateway {
    setup_with(test_config(), CountingEngine::new()).await
}

pub async fn setup_with(config: GatewayConfig, engine: CountingEngine) -> TestGateway {
    let store = Arc::new(FlakyStore::new());
    let engine = Arc::new(engine);
    let gateway = Gateway::new(
        store.clone(),
        Arc::new(InMemoryCredentialCache::new()),
        engine.clone(),
        &config,
    );

    let admin = "vgw_bootstrap_admin_secret".to_string();
    gateway
        .credentials()
        .ensure_bootstrap(TENANT, &admin)
        .await
        .unwrap();

    TestGateway {
        gateway: Arc::new(gateway),
        engine,
        store,
        admin,
    }
}

impl TestGateway {
    /// Issue a key directly through the credential store and return its secret.
    pub async fn issue(&self, permissions: &[Permission], scope: Option<&[&str]>) -> String {
        self.issue_in(TENANT, permissions, scope).await
    }

    pub async fn issue_in(
        &self,
        tenant: &str,
        permissions: &[Permission],
        scope: Option<&[&str]>,
    ) -> String {
        let scope = scope.map(|patterns| {
            patterns
                .iter()
                .map(|p| p.parse::<ScopePattern>().unwrap())
                .collect()
        });
        self.gateway
            .credentials()
            .create(
                tenant,
                CreateCredential {
                    name: "test".to_string(),
                    permissions: permissions.to_vec(),
                    scope,
                },
            )
            .await
            .unwrap()
            .secret
    }
}
