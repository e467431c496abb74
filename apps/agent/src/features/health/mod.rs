use axum::routing::get;
use axum::{Extension, Json, Router};

use super::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/status", get(status))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status(Extension(st): Extension<AppState>) -> Json<serde_json::Value> {
    Json(st.plugin.status().await)
}
