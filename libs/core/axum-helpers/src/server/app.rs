use super::shutdown::ShutdownCoordinator;
use crate::errors::handlers::not_found;
use crate::http::{create_cors_layer, security_headers};
use axum::{Router, middleware};
use core_config::{env_optional, server::ServerConfig};
use std::io;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, info};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable as ScalarServable};
use utoipa_swagger_ui::SwaggerUi;

/// Wrap the API routes with docs, tracing, security headers and compression.
///
/// - `apis` is nested under `/api` and must already carry its state.
/// - Swagger UI is served at `/swagger-ui`, Scalar at `/scalar`.
/// - CORS is added only when `CORS_ALLOWED_ORIGIN` is set.
///
/// Health endpoints are merged by the caller with [`super::health_router`].
pub fn create_router<T>(apis: Router) -> io::Result<Router>
where
    T: OpenApi + 'static,
{
    let mut router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", T::openapi()))
        .merge(Scalar::with_url("/scalar", T::openapi()))
        .nest("/api", apis)
        .fallback(not_found)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(security_headers));

    if let Some(origins) = env_optional("CORS_ALLOWED_ORIGIN") {
        info!(origins = %origins, "CORS enabled");
        router = router.layer(create_cors_layer(&origins)?);
    }

    Ok(router.layer(CompressionLayer::new()))
}

/// Serve `router` until SIGINT/SIGTERM, then run `cleanup` within
/// `shutdown_timeout`.
///
/// `coordinator` is triggered on the signal, so background tasks holding a
/// clone stop together with the server. In-flight requests finish before
/// `axum::serve` returns.
pub async fn create_production_app<F>(
    router: Router,
    server_config: &ServerConfig,
    coordinator: ShutdownCoordinator,
    shutdown_timeout: Duration,
    cleanup: F,
) -> io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let signal_handle = coordinator.clone();
    tokio::spawn(async move { signal_handle.wait_for_signal().await });

    let listener = tokio::net::TcpListener::bind(server_config.address()).await?;
    info!("Server starting on {}", listener.local_addr()?);

    let serve_coordinator = coordinator.clone();
    let serve_result = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move { serve_coordinator.wait().await })
        .await
        .inspect_err(|e| tracing::error!("Server encountered an error: {:?}", e));
    coordinator.shutdown();

    info!(timeout = ?shutdown_timeout, "Running cleanup");
    match tokio::time::timeout(shutdown_timeout, cleanup).await {
        Ok(()) => info!("Cleanup completed"),
        Err(_) => tracing::warn!(timeout = ?shutdown_timeout, "Cleanup timed out, forcing shutdown"),
    }

    serve_result
}
