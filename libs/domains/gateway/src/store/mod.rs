//! Durable metadata for credentials and resource handles.
//!
//! Every mutating call is a compare-and-set on the record's `version`, so two
//! writers racing on the same record cannot both win.

mod memory;
mod postgres;

pub use memory::InMemoryMetadataStore;
pub use postgres::PgMetadataStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use database::common::{RetryConfig, retry_with_backoff_if};
use std::future::Future;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Credential, ResourceHandle, ResourceKey};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Metadata store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt metadata record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Run a store call, retrying only transient failures.
pub(crate) async fn with_retry<T, F, Fut>(retry: &RetryConfig, operation: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    retry_with_backoff_if(operation, retry.clone(), StoreError::is_transient).await
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a credential. Returns false if the id or hash already exists.
    async fn insert_credential(&self, credential: &Credential) -> StoreResult<bool>;

    async fn find_credential_by_hash(&self, secret_hash: &str) -> StoreResult<Option<Credential>>;

    async fn find_credential(&self, tenant: &str, id: Uuid) -> StoreResult<Option<Credential>>;

    async fn list_credentials(&self, tenant: &str) -> StoreResult<Vec<Credential>>;

    /// Replace a credential if the stored version is still `expected_version`.
    async fn update_credential(
        &self,
        credential: &Credential,
        expected_version: i64,
    ) -> StoreResult<bool>;

    /// Best-effort `last_used_at` bump; does not change the version.
    async fn touch_credential(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;

    async fn count_credentials(&self, tenant: &str) -> StoreResult<u64>;

    /// Insert a resource record if no record exists for its key.
    async fn insert_resource(&self, handle: &ResourceHandle) -> StoreResult<bool>;

    async fn find_resource(&self, key: &ResourceKey) -> StoreResult<Option<ResourceHandle>>;

    /// Current version of a record, without loading the rest of it.
    async fn resource_version(&self, key: &ResourceKey) -> StoreResult<Option<i64>>;

    async fn update_resource(
        &self,
        handle: &ResourceHandle,
        expected_version: i64,
    ) -> StoreResult<bool>;

    async fn delete_resource(&self, key: &ResourceKey, expected_version: i64)
    -> StoreResult<bool>;

    /// Databases of a tenant when `database` is None, otherwise the tables of
    /// that database. Sorted by path.
    async fn list_resources(
        &self,
        tenant: &str,
        database: Option<&str>,
    ) -> StoreResult<Vec<ResourceHandle>>;
}
