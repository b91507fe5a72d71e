//! HTTP API: router, shared state, and the small status/debug handlers

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::adapters::PlexClient;
use crate::artwork::{image_handler, ArtworkCache};
use crate::hub::{ws_handler, BroadcastHub};
use crate::state::SharedStore;
use crate::webhook::{webhook_handler, IngestGateway};

/// Plex attaches a thumbnail to multipart webhooks
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub hub: BroadcastHub,
    pub gateway: Arc<IngestGateway>,
    pub plex: Arc<PlexClient>,
    pub artwork: Arc<ArtworkCache>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        store: SharedStore,
        hub: BroadcastHub,
        plex: Arc<PlexClient>,
        artwork: ArtworkCache,
        username: impl Into<String>,
    ) -> Self {
        let gateway = IngestGateway::new(store.clone(), Arc::new(hub.clone()), username);
        Self {
            store,
            hub,
            gateway: Arc::new(gateway),
            plex,
            artwork: Arc::new(artwork),
            started_at: Instant::now(),
        }
    }
}

/// All routes with middleware applied
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/webhook", post(webhook_handler))
        .route("/ws", get(ws_handler))
        .route("/api/image", get(image_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/api/debug/state", get(debug_state_handler))
        .route("/api/debug/sessions", get(debug_sessions_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    details: String,
}

fn internal_error(error: &str, details: impl ToString) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: error.to_string(),
            details: details.to_string(),
        }),
    )
        .into_response()
}

/// GET /health - liveness probe
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub git_sha: &'static str,
    pub uptime_secs: u64,
    pub connections: usize,
    pub has_state: bool,
}

/// GET /status - service status
pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let has_state = matches!(state.store.load().await, Ok(Some(_)));

    Json(StatusResponse {
        service: "plex-nowplaying",
        version: env!("NOWPLAYING_VERSION"),
        git_sha: env!("NOWPLAYING_GIT_SHA"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        connections: state.hub.connection_count().await,
        has_state,
    })
}

/// GET /api/debug/state - what the store currently holds
pub async fn debug_state_handler(State(state): State<AppState>) -> Response {
    match state.store.load().await {
        Ok(current) => Json(serde_json::json!({ "currentState": current })).into_response(),
        Err(e) => {
            tracing::error!("Failed to read stored state: {}", e);
            internal_error("Failed to get stored state", e)
        }
    }
}

/// GET /api/debug/sessions - live sessions as the server reports them
pub async fn debug_sessions_handler(State(state): State<AppState>) -> Response {
    match state.plex.sessions().await {
        Ok(sessions) => Json(serde_json::json!({ "sessions": sessions })).into_response(),
        Err(e) => internal_error("Failed to get sessions", e),
    }
}
