use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::static_files::{client_js_handler, index_handler};
use crate::state::AppState;

/// Offers are a few kilobytes; anything far larger is not an SDP
const MAX_BODY_BYTES: usize = 256 * 1024;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/client.js", get(client_js_handler))
        .route("/offer", post(handlers::offer))
        .route("/health", get(handlers::health_check))
        .route("/sessions", get(handlers::list_sessions))
        .route("/config", get(handlers::get_config))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
