use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};

use crate::AppState;

use super::service::{import_topology, ImportResult, TopologyGraph};

pub fn router() -> Router<AppState> {
    Router::new().route("/api/labs/:lab/topology/import", post(import))
}

async fn import(
    State(st): State<AppState>,
    Path(lab): Path<String>,
    Json(graph): Json<TopologyGraph>,
) -> Result<Json<ImportResult>, (StatusCode, String)> {
    import_topology(&st.db, &lab, &graph)
        .await
        .map(Json)
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))
}
