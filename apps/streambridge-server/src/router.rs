use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api;
use crate::app_state::AppState;

/// REST surface of the bridge. CORS is wide open by design: the consumer is
/// any browser, and the only secret is the token itself.
pub fn build_router() -> Router<AppState> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/register", post(api::register::register))
        .route("/status/{token}", get(api::status::status))
        .route("/download/{token}", get(api::download::download))
        .route(
            "/download/{token}/{filename}",
            get(api::download::download_named),
        )
        .route("/stats", get(api::meta::stats))
        .route("/health", get(api::meta::health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
