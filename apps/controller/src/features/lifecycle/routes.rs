//! Lifecycle endpoints: lab deploy, per-node actions, destroy.

use archetype_types::DesiredState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use uuid::Uuid;

use crate::features::agents::client::AgentClient;
use crate::features::agents::repo as agents_repo;
use crate::features::labs::repo as labs_repo;
use crate::AppState;

use super::service::{LifecycleResult, NodeLifecycleManager};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/labs/:lab/deploy", post(deploy_lab))
        .route("/api/labs/:lab/stop", post(stop_lab))
        .route("/api/labs/:lab/destroy", post(destroy_lab))
        .route("/api/labs/:lab/nodes/:node/start", post(start_node))
        .route("/api/labs/:lab/nodes/:node/stop", post(stop_node))
}

/// Set desired state for the given nodes and run one lifecycle pass.
async fn run_for_nodes(
    st: AppState,
    lab_id: &str,
    node_names: Option<Vec<String>>,
    desired: DesiredState,
) -> Result<LifecycleResult, (StatusCode, String)> {
    let lab = labs_repo::get_lab(&st.db, lab_id)
        .await
        .map_err(internal)?
        .ok_or((StatusCode::NOT_FOUND, format!("unknown lab {lab_id}")))?;

    let nodes = labs_repo::nodes_for_lab(&st.db, lab_id).await.map_err(internal)?;
    let selected: Vec<_> = match &node_names {
        Some(names) => nodes.iter().filter(|n| names.contains(&n.name)).collect(),
        None => nodes.iter().collect(),
    };
    if selected.is_empty() {
        return Err((StatusCode::NOT_FOUND, "no matching nodes".into()));
    }

    // Ensure a NodeState row exists per node and stamp the desired state.
    let existing = labs_repo::states_for_lab(&st.db, lab_id).await.map_err(internal)?;
    let mut node_ids = Vec::new();
    for node in selected {
        node_ids.push(node.id);
        let mut state = existing
            .iter()
            .find(|s| s.node_id == node.id)
            .cloned()
            .unwrap_or(labs_repo::NodeStateRow {
                lab_id: lab_id.to_string(),
                node_id: node.id,
                node_name: node.name.clone(),
                desired_state: "running".into(),
                actual_state: "undeployed".into(),
                starting_started_at: None,
                stopping_started_at: None,
                boot_started_at: None,
                error_message: None,
                is_ready: false,
                image_sync_status: None,
            });
        state.desired_state = match desired {
            DesiredState::Running => "running".into(),
            DesiredState::Stopped => "stopped".into(),
        };
        labs_repo::upsert_state(&st.db, &state).await.map_err(internal)?;
    }

    let manager = NodeLifecycleManager::new(st, lab, Uuid::new_v4(), node_ids);
    manager.execute().await.map_err(internal)
}

async fn deploy_lab(
    State(st): State<AppState>,
    Path(lab): Path<String>,
) -> Result<Json<LifecycleResult>, (StatusCode, String)> {
    run_for_nodes(st, &lab, None, DesiredState::Running)
        .await
        .map(Json)
}

async fn stop_lab(
    State(st): State<AppState>,
    Path(lab): Path<String>,
) -> Result<Json<LifecycleResult>, (StatusCode, String)> {
    run_for_nodes(st, &lab, None, DesiredState::Stopped)
        .await
        .map(Json)
}

async fn start_node(
    State(st): State<AppState>,
    Path((lab, node)): Path<(String, String)>,
) -> Result<Json<LifecycleResult>, (StatusCode, String)> {
    run_for_nodes(st, &lab, Some(vec![node]), DesiredState::Running)
        .await
        .map(Json)
}

async fn stop_node(
    State(st): State<AppState>,
    Path((lab, node)): Path<(String, String)>,
) -> Result<Json<LifecycleResult>, (StatusCode, String)> {
    run_for_nodes(st, &lab, Some(vec![node]), DesiredState::Stopped)
        .await
        .map(Json)
}

/// Destroy the lab on every agent that might hold a piece of it, then drop
/// placements.
async fn destroy_lab(
    State(st): State<AppState>,
    Path(lab): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let placements = labs_repo::placements_for_lab(&st.db, &lab).await.map_err(internal)?;
    let mut hosts: Vec<String> = placements.iter().map(|p| p.host_id.clone()).collect();
    hosts.sort();
    hosts.dedup();

    let agents = agents_repo::list(&st.db).await.map_err(internal)?;
    let mut errors = Vec::new();
    for host_id in &hosts {
        let Some(agent) = agents.iter().find(|a| &a.id == host_id) else {
            continue;
        };
        let client = AgentClient::new(&agent.address, &st.secret, st.agent_timeout_secs);
        match client.destroy_lab(&lab).await {
            Ok(response) if response.success => {}
            Ok(response) => errors.push(response.error.unwrap_or_default()),
            Err(err) => errors.push(err.to_string()),
        }
    }
    for placement in &placements {
        let _ = labs_repo::delete_placement(&st.db, &lab, &placement.node_name).await;
    }

    Ok(Json(serde_json::json!({
        "success": errors.is_empty(),
        "errors": errors,
    })))
}

fn internal<E: std::fmt::Display>(err: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
