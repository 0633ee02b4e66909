// HTTP routes configuration
// Author: kelexine (https://github.com/kelexine)

use super::handlers::{
    delete_video_cache_handler, estimate_handler, evict_expired_handler, health_handler,
    list_cache_handler, list_providers_handler, metrics_handler, translate_handler,
    validate_provider_handler,
};
use super::middleware::{request_id_layers, track_requests};
use crate::config::AppConfig;
use crate::orchestrator::Orchestrator;
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub orchestrator: Arc<Orchestrator>,
    /// Cancelled on shutdown; every batch runs under a child token.
    pub shutdown: CancellationToken,
}

pub fn create_router(
    config: AppConfig,
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
) -> Router {
    let body_limit = config.server.body_limit_bytes;
    let state = AppState {
        config: Arc::new(config),
        orchestrator,
        shutdown,
    };

    let (set_request_id, propagate_request_id) = request_id_layers();

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/translate", post(translate_handler))
        .route("/v1/providers", get(list_providers_handler))
        .route("/v1/providers/:id/validate", post(validate_provider_handler))
        .route("/v1/providers/:id/estimate", post(estimate_handler))
        .route("/v1/cache", get(list_cache_handler))
        .route("/v1/cache/:video_id", delete(delete_video_cache_handler))
        .route("/v1/cache/evict-expired", post(evict_expired_handler))
        .route_layer(middleware::from_fn(track_requests))
        // Long tracks arrive as a single JSON body
        .layer(tower_http::limit::RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(propagate_request_id)
        .layer(set_request_id)
        .with_state(state)
}
