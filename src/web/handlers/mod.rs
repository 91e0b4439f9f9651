use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::webrtc::{SessionDescription, SessionInfo};

// ============================================================================
// Health
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Negotiation
// ============================================================================

/// Accept `{sdp, type}` and answer with the same shape
///
/// Body decoding failures are reported through `AppError` so every
/// rejection carries the same JSON error body.
pub async fn offer(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<SessionDescription>, JsonRejection>,
) -> Result<Json<SessionDescription>> {
    let Json(offer) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    debug!("Received offer ({} bytes of sdp)", offer.sdp.len());

    let answer = state.endpoint.handle_offer(offer).await?;
    Ok(Json(answer))
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Serialize)]
pub struct SessionsResponse {
    pub count: usize,
    pub max_sessions: usize,
    pub sessions: Vec<SessionInfo>,
}

pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionsResponse> {
    let sessions = state.registry.snapshot();
    Json(SessionsResponse {
        count: sessions.len(),
        max_sessions: state.registry.max_sessions(),
        sessions,
    })
}

// ============================================================================
// Config
// ============================================================================

/// Effective configuration with TURN credentials blanked out
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<AppConfig> {
    let mut config = (*state.config.get()).clone();
    for turn in &mut config.webrtc.turn_servers {
        if !turn.credential.is_empty() {
            turn.credential = "***".to_string();
        }
    }
    Json(config)
}
