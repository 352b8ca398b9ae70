//! # Axum Helpers
//!
//! Shared HTTP plumbing for the gateway binary and its domain routers.
//!
//! - **[`errors`]**: `AppError`, `ErrorCode` and the `ErrorResponse` body
//! - **[`server`]**: router assembly with OpenAPI docs, health endpoints,
//!   graceful shutdown
//! - **[`http`]**: CORS and security-header middleware
//! - **[`extractors`]**: UUID path extractor
//! - **[`audit`]**: structured audit events on the `audit` target
//!
//! ```ignore
//! use axum_helpers::server::{create_production_app, create_router, health_router};
//!
//! let router = create_router::<ApiDoc>(api_routes)?
//!     .merge(health_router(core_config::app_info!()));
//! create_production_app(router, &server_config, shutdown, Duration::from_secs(30), cleanup).await?;
//! ```

pub mod audit;
pub mod errors;
pub mod extractors;
pub mod http;
pub mod server;

pub use server::{
    HealthCheckFuture, HealthResponse, ShutdownCoordinator, create_production_app, create_router,
    health_router, run_health_checks, shutdown_signal,
};

pub use http::{create_cors_layer, security_headers};

pub use errors::{AppError, ErrorCode, ErrorResponse};

pub use extractors::UuidPath;

pub use audit::{AuditEvent, AuditOutcome, extract_ip_from_headers};
