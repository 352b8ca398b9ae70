use axum_helpers::{ShutdownCoordinator, create_production_app, create_router, health_router};
use core_config::tracing::{init_tracing, install_color_eyre};
use domain_gateway::{
    EngineKind, Gateway, InMemoryEngine, PgMetadataStore, QdrantEngine, StorageEngine,
    credential_cache,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

mod api;
mod config;
mod openapi;
mod state;

use config::Config;
use state::AppState;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    install_color_eyre();

    let config = Config::from_env()?;
    init_tracing(&config.environment);

    let db = database::postgres::connect_from_config_with_retry(config.database.clone(), None)
        .await
        .map_err(|e| eyre::eyre!("PostgreSQL connection failed: {}", e))?;
    database::postgres::run_migrations::<migration::Migrator>(&db, config.app.name)
        .await
        .map_err(|e| eyre::eyre!("Migrations failed: {}", e))?;

    let (redis, cache_timeout) = match &config.redis {
        Some(redis_config) => {
            let redis = database::redis::connect_from_config_with_retry(redis_config.clone(), None)
                .await
                .map_err(|e| eyre::eyre!("Redis connection failed: {}", e))?;
            (
                Some(redis),
                Duration::from_millis(redis_config.response_timeout_ms),
            )
        }
        None => {
            info!("REDIS_URL not set, caching credentials in process");
            (None, Duration::ZERO)
        }
    };

    let engine: Arc<dyn StorageEngine> = match (config.gateway.engine, &config.qdrant) {
        (EngineKind::Qdrant, Some(qdrant_config)) => {
            info!(url = %qdrant_config.url, "Using Qdrant storage engine");
            let engine = QdrantEngine::new(qdrant_config.clone())
                .map_err(|e| eyre::eyre!("Qdrant client failed: {}", e))?;
            if let Err(e) = engine.health_check().await {
                tracing::warn!(error = %e, "Qdrant not reachable yet, continuing");
            }
            Arc::new(engine)
        }
        (kind, _) => {
            info!(engine = %kind, "Using in-memory storage engine");
            Arc::new(InMemoryEngine::new())
        }
    };

    let gateway = Gateway::new(
        Arc::new(PgMetadataStore::new(db.clone())),
        credential_cache(redis.clone(), cache_timeout),
        engine,
        &config.gateway,
    );

    if let Some(bootstrap) = &config.gateway.bootstrap {
        let seeded = gateway
            .credentials()
            .ensure_bootstrap(&bootstrap.tenant, &bootstrap.secret)
            .await
            .map_err(|e| eyre::eyre!("Bootstrap credential failed: {}", e))?;
        if !seeded {
            info!(tenant = %bootstrap.tenant, "Tenant already has credentials, bootstrap skipped");
        }
    }

    let gateway = Arc::new(gateway);
    let coordinator = ShutdownCoordinator::new();
    let sweeper = gateway.rate_limiter().spawn_sweeper(coordinator.clone());

    let state = AppState { db, redis };
    let router = create_router::<openapi::ApiDoc>(api::routes(gateway.clone()))?;
    let app = router
        .merge(health_router(config.app))
        .merge(api::ready_router(state.clone()));

    info!(
        max_concurrent = config.gateway.max_concurrent_requests,
        "Starting vector gateway"
    );

    create_production_app(
        app,
        &config.server,
        coordinator,
        config.shutdown_timeout,
        async move {
            gateway.admission().close();
            if let Err(e) = sweeper.await {
                tracing::warn!(error = %e, "Rate-limit sweeper ended abnormally");
            }

            match state.db.close().await {
                Ok(()) => info!("PostgreSQL connection closed"),
                Err(e) => tracing::error!("Error closing PostgreSQL: {}", e),
            }
            // ConnectionManager closes on drop.
            drop(state.redis);
        },
    )
    .await
    .map_err(|e| eyre::eyre!("Server error: {}", e))?;

    info!("Vector gateway shutdown complete");
    Ok(())
}
