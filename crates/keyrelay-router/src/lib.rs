pub mod admin;
pub mod proxy;

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;

use keyrelay_core::AppState;

pub use admin::admin_router;
pub use proxy::proxy_router;

/// Full HTTP surface: `/v1/*`, admin under `/admin` (and `/api/admin`), `/health`.
pub fn app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(proxy_router(state.clone()))
        .nest("/admin", admin_router(state.clone()))
        .nest("/api/admin", admin_router(state))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "ok": true })))
}
