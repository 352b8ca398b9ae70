use axum::Router;
use axum::routing::get;
use domain_gateway::Gateway;
use std::sync::Arc;

use crate::state::AppState;

pub mod health;

/// API routes without the `/api` prefix, which `create_router` adds.
pub fn routes(gateway: Arc<Gateway>) -> Router {
    Router::new().nest("/v1", domain_gateway::handlers::router(gateway))
}

/// `/ready`, checking Postgres and Redis when configured.
pub fn ready_router(state: AppState) -> Router {
    Router::new()
        .route("/ready", get(health::ready_handler))
        .with_state(state)
}
