//! Agent registration/heartbeat endpoints consumed by agents themselves.

use archetype_types::{HeartbeatRequest, RegisterAgentRequest};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{extract::State, Json, Router};
use chrono::Utc;

use crate::AppState;

use super::repo::{self, AgentRow};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/agents/register", post(register))
        .route("/api/agents/heartbeat", post(heartbeat))
        .route("/api/agents", get(list))
}

async fn register(
    State(st): State<AppState>,
    Json(req): Json<RegisterAgentRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let row = AgentRow {
        id: req.agent_id,
        name: req.name,
        address: req.address,
        providers: serde_json::json!(req.providers),
        last_heartbeat: Utc::now(),
    };
    repo::upsert(&st.db, &row)
        .await
        .map_err(internal)?;
    tracing::info!(agent_id = %row.id, address = %row.address, "agent registered");
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn heartbeat(
    State(st): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    repo::touch_heartbeat(&st.db, &req.agent_id, req.timestamp)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn list(
    State(st): State<AppState>,
) -> Result<Json<Vec<AgentRow>>, (StatusCode, String)> {
    let rows = repo::list(&st.db).await.map_err(internal)?;
    Ok(Json(rows))
}

fn internal<E: std::fmt::Display>(err: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
