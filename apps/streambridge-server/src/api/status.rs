use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;

use streambridge_protocol::SessionState;

use crate::app_state::AppState;
use crate::responses;

/// `GET /status/{token}`: session metadata for the provider's UI.
pub async fn status(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    match state.registry().snapshot(&token) {
        // A completed session is indistinguishable from a released one.
        Some(snapshot) if snapshot.status == SessionState::Completed => {
            responses::not_found("file not found")
        }
        Some(snapshot) => Json(snapshot).into_response(),
        None => responses::not_found("file not found"),
    }
}
