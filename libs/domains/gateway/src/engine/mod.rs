//! Storage engine seam.
//!
//! The gateway never talks to a vector store directly: every data-plane call
//! goes through a [`StorageEngine`] using the [`EngineHandle`] the engine
//! returned at create time.

mod memory;
#[cfg(feature = "qdrant")]
mod qdrant;

pub use memory::InMemoryEngine;
#[cfg(feature = "qdrant")]
pub use qdrant::{QdrantConfig, QdrantEngine};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
    EngineHandle, InsertSummary, ResourceConfig, RowPage, SearchHit, SearchQuery, VectorRecord,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("engine rejected the request: {0}")]
    Rejected(String),

    #[error("engine resource not found: {0}")]
    NotFound(String),

    #[error("engine error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Provision storage for a database or table under `namespace`. Calling
    /// it again for an existing namespace succeeds with the same handle.
    async fn create_resource(
        &self,
        namespace: &str,
        config: &ResourceConfig,
    ) -> EngineResult<EngineHandle>;

    /// Release the storage behind `handle`. Dropping a handle the engine no
    /// longer knows about succeeds.
    async fn drop_resource(&self, handle: &EngineHandle) -> EngineResult<()>;

    async fn insert(
        &self,
        handle: &EngineHandle,
        rows: Vec<VectorRecord>,
    ) -> EngineResult<InsertSummary>;

    async fn search(&self, handle: &EngineHandle, query: SearchQuery)
    -> EngineResult<Vec<SearchHit>>;

    /// Read up to `limit` rows after skipping `offset`, in a stable order,
    /// together with the table's total row count.
    async fn scan(&self, handle: &EngineHandle, offset: u64, limit: u32)
    -> EngineResult<RowPage>;
}
