//! Vector Gateway Domain
//!
//! Multi-tenant front door for a vector storage engine. Callers present an
//! API key, get checked against its permissions and scope, are rate limited
//! per key and capped globally, and only then reach the engine.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐
//! │    Handlers    │  ← HTTP endpoints, bearer token extraction
//! └───────┬────────┘
//!         │
//! ┌───────▼────────┐
//! │    Gateway     │  ← Per-request session state machine
//! └───────┬────────┘
//!         │
//!   ┌─────┼──────────────┬───────────────┬──────────────┐
//!   │     │              │               │              │
//! ┌─▼─────▼──┐  ┌────────▼───┐  ┌────────▼──┐  ┌────────▼──────┐
//! │Credential│  │ Permission │  │   Rate    │  │  Connection   │
//! │  Store   │  │ Evaluator  │  │  Limiter  │  │   Admission   │
//! └────┬─────┘  └────────────┘  └───────────┘  └───────────────┘
//!      │                 ┌──────────────┐
//!      │                 │   Resource   │
//!      │                 │   Registry   │
//!      │                 └──┬────────┬──┘
//!      │                    │        │
//! ┌────▼────────────────────▼──┐  ┌──▼─────────────┐
//! │ MetadataStore (+ cache)    │  │ StorageEngine  │
//! │ Postgres / in-memory       │  │ Qdrant / memory│
//! └────────────────────────────┘  └────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use domain_gateway::{
//!     Gateway, GatewayConfig, InMemoryCredentialCache, InMemoryEngine, InMemoryMetadataStore,
//!     handlers,
//! };
//! use std::sync::Arc;
//!
//! let gateway = Gateway::new(
//!     Arc::new(InMemoryMetadataStore::new()),
//!     Arc::new(InMemoryCredentialCache::new()),
//!     Arc::new(InMemoryEngine::new()),
//!     &GatewayConfig::default(),
//! );
//!
//! let router = handlers::router(Arc::new(gateway));
//! ```

pub mod admission;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod models;
pub mod permission;
pub mod ratelimit;
pub mod registry;
pub mod session;
pub mod store;

pub use admission::{AdmissionSlot, ConnectionAdmission};
pub use cache::{
    CacheError, CredentialCache, InMemoryCredentialCache, NoopCredentialCache,
    RedisCredentialCache, credential_cache,
};
pub use config::{BootstrapCredential, EngineKind, GatewayConfig, RateLimitConfig};
pub use credentials::CredentialStore;
pub use engine::{EngineError, EngineResult, InMemoryEngine, StorageEngine};
#[cfg(feature = "qdrant")]
pub use engine::{QdrantConfig, QdrantEngine};
pub use error::{ErrorKind, GatewayError, GatewayResult};
pub use handlers::ApiDoc;
pub use models::{
    Action, CreateCredential, CreateDatabase, CreateTable, Credential, CredentialStatus,
    CredentialView, DistanceMetric, InsertRows, IssuedCredential, ListRows, Permission,
    ResourceConfig, ResourceHandle, ResourceKey, ResourcePath, ResourceState, RowPage,
    ScopePattern, SearchRequest, VectorRecord,
};
pub use permission::{Decision, DenyReason};
pub use ratelimit::RateLimiter;
pub use registry::{Created, ResourceRegistry};
pub use session::{
    Gateway, GatewayRequest, GatewayResponse, MalformedRequest, Operation, SessionState,
};
pub use store::{InMemoryMetadataStore, MetadataStore, PgMetadataStore, StoreError};
