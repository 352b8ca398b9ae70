//! Connectors and shared utilities for the gateway's backing services.
//!
//! - PostgreSQL (`postgres` feature, default) holds credentials and the
//!   resource registry. It is the source of truth.
//! - Redis (`redis` feature, default) is an optional credential cache.
//!
//! The `config` feature adds `core_config::FromEnv` implementations for the
//! connection configs.
//!
//! ```ignore
//! use database::{postgres, redis};
//!
//! let db = postgres::connect_from_config_with_retry(pg_config, None).await?;
//! postgres::run_migrations::<migration::Migrator>(&db, "gateway_api").await?;
//!
//! let cache = redis::connect_from_config_with_retry(redis_config, None).await?;
//! ```

pub mod common;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "redis")]
pub mod redis;

pub use common::{DatabaseError, DatabaseResult};
