use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{SecondsFormat, Utc};

use streambridge_protocol::HealthResponse;

use crate::app_state::AppState;

/// `GET /health`: liveness probe.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".into(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}

/// `GET /stats`: process-wide transfer counters.
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let (registered_files, active_streams) = state.registry().counts();
    Json(state.stats().snapshot(registered_files, active_streams))
}
