//! Deploy and per-node lifecycle endpoints.
//!
//! Expected failures come back as `{success: false, error}` with an error
//! kind; only genuinely broken dependencies surface as HTTP errors.

use archetype_types::{
    ActionResponse, DeployRequest, DeployResponse, NodeInfo, TopologyLinkSpec, TopologyNodeSpec,
};
use axum::extract::Path;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;

use crate::providers::docker::DockerProvider;
use crate::providers::{Provider, ProviderKind};

use super::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/deploy", post(deploy))
        .route("/nodes/:lab/:node/start", post(start_node))
        .route("/nodes/:lab/:node/stop", post(stop_node))
        .route("/nodes/:lab/:node/destroy", post(destroy_node))
        .route("/labs/:lab/destroy", post(destroy_lab))
        .route("/labs/:lab/nodes", get(lab_nodes))
        .route("/labs", get(discover_labs))
        .route("/labs/cleanup-orphans", post(cleanup_orphans))
}

async fn deploy(
    Extension(st): Extension<AppState>,
    Json(req): Json<DeployRequest>,
) -> Json<DeployResponse> {
    let topology = &req.topology;

    // A node pinned to another host in our slice means the controller's
    // filtering went wrong; refuse rather than build it in the wrong place.
    let agent_id = &crate::config::settings().agent_id;
    let misplaced: Vec<String> = topology
        .nodes
        .iter()
        .filter(|node| {
            node.host_id
                .as_deref()
                .map(|host| host != agent_id)
                .unwrap_or(false)
        })
        .map(|node| node.name.clone())
        .collect();
    if !misplaced.is_empty() {
        return Json(DeployResponse {
            success: false,
            error: Some(format!(
                "nodes pinned to a different host: {}",
                misplaced.join(", ")
            )),
            error_kind: Some(archetype_types::AgentErrorKind::Validation),
            ..Default::default()
        });
    }

    let docker_result = match st.docker.deploy(topology).await {
        Ok(resp) => resp,
        Err(err) => {
            tracing::error!(lab_id = %req.lab_id, error = %err, "docker deploy failed");
            return Json(DeployResponse {
                success: false,
                error: Some(err.to_string()),
                ..Default::default()
            });
        }
    };
    if !docker_result.success {
        return Json(docker_result);
    }

    let libvirt_result = match st.libvirt.deploy(topology).await {
        Ok(resp) => resp,
        Err(err) => {
            tracing::error!(lab_id = %req.lab_id, error = %err, "libvirt deploy failed");
            return Json(DeployResponse {
                success: false,
                error: Some(err.to_string()),
                nodes: docker_result.nodes,
                ..Default::default()
            });
        }
    };

    let mut merged = docker_result;
    merged.success = merged.success && libvirt_result.success;
    merged.nodes.extend(libvirt_result.nodes);
    merged.missing_images.extend(libvirt_result.missing_images);
    if merged.error.is_none() {
        merged.error = libvirt_result.error;
    }
    if merged.error_kind.is_none() {
        merged.error_kind = libvirt_result.error_kind;
    }
    Json(merged)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartNodeRequest {
    #[serde(default)]
    pub node: Option<TopologyNodeSpec>,
    #[serde(default)]
    pub links: Vec<TopologyLinkSpec>,
}

async fn start_node(
    Extension(st): Extension<AppState>,
    Path((lab, node_name)): Path<(String, String)>,
    Json(req): Json<StartNodeRequest>,
) -> Json<ActionResponse> {
    let node = match req.node {
        Some(node) => node,
        None => TopologyNodeSpec {
            name: node_name.clone(),
            display_name: None,
            kind: "linux".into(),
            image: String::new(),
            startup_config: None,
            interface_count: None,
            host_id: None,
        },
    };
    let result = match provider_kind_for(&lab, &node_name, Some(&node)).await {
        ProviderKind::Docker => st.docker.start_node(&lab, &node, &req.links).await,
        ProviderKind::Libvirt => st.libvirt.start_node(&lab, &node, &req.links).await,
    };
    Json(match result {
        Ok(()) => ActionResponse::ok(),
        Err(err) => ActionResponse::err(err.to_string()),
    })
}

async fn stop_node(
    Extension(st): Extension<AppState>,
    Path((lab, node_name)): Path<(String, String)>,
) -> Json<ActionResponse> {
    let result = match provider_kind_for(&lab, &node_name, None).await {
        ProviderKind::Docker => st.docker.stop_node(&lab, &node_name).await,
        ProviderKind::Libvirt => st.libvirt.stop_node(&lab, &node_name).await,
    };
    Json(match result {
        Ok(()) => ActionResponse::ok(),
        Err(err) => ActionResponse::err(err.to_string()),
    })
}

async fn destroy_node(
    Extension(st): Extension<AppState>,
    Path((lab, node_name)): Path<(String, String)>,
) -> Json<ActionResponse> {
    let result = match provider_kind_for(&lab, &node_name, None).await {
        ProviderKind::Docker => st.docker.destroy_node(&lab, &node_name).await,
        ProviderKind::Libvirt => st.libvirt.destroy_node(&lab, &node_name).await,
    };
    Json(match result {
        Ok(()) => ActionResponse::ok(),
        Err(err) => ActionResponse::err(err.to_string()),
    })
}

async fn destroy_lab(
    Extension(st): Extension<AppState>,
    Path(lab): Path<String>,
) -> Json<ActionResponse> {
    if let Err(err) = st.docker.destroy(&lab).await {
        return Json(ActionResponse::err(err.to_string()));
    }
    if let Err(err) = st.libvirt.destroy(&lab).await {
        return Json(ActionResponse::err(err.to_string()));
    }
    Json(ActionResponse::ok())
}

async fn lab_nodes(
    Extension(st): Extension<AppState>,
    Path(lab): Path<String>,
) -> Json<Vec<NodeInfo>> {
    let mut nodes = st.docker.status(&lab).await.unwrap_or_default();
    nodes.extend(st.libvirt.status(&lab).await.unwrap_or_default());
    Json(nodes)
}

async fn discover_labs(
    Extension(st): Extension<AppState>,
) -> Json<serde_json::Value> {
    match st.docker.discover_labs().await {
        Ok(labs) => Json(serde_json::json!({ "success": true, "labs": labs })),
        Err(err) => Json(serde_json::json!({ "success": false, "error": err.to_string() })),
    }
}

#[derive(Debug, Deserialize)]
struct CleanupOrphansRequest {
    #[serde(default)]
    valid_lab_ids: Vec<String>,
}

/// Stop containers belonging to labs the controller no longer tracks.
async fn cleanup_orphans(
    Extension(st): Extension<AppState>,
    Json(req): Json<CleanupOrphansRequest>,
) -> Json<serde_json::Value> {
    let valid: std::collections::HashSet<String> = req.valid_lab_ids.into_iter().collect();
    match st.docker.cleanup_orphan_containers(&valid).await {
        Ok(stopped) => Json(serde_json::json!({ "success": true, "stopped": stopped })),
        Err(err) => Json(serde_json::json!({ "success": false, "error": err.to_string() })),
    }
}

/// Route a node action to the provider that owns it: the node spec's image
/// when present, otherwise whichever runtime knows the name.
async fn provider_kind_for(
    lab: &str,
    node_name: &str,
    node: Option<&TopologyNodeSpec>,
) -> ProviderKind {
    if let Some(node) = node {
        if !node.image.is_empty() {
            return crate::providers::provider_for_image(&node.image);
        }
    }
    let container = DockerProvider::container_name(lab, node_name);
    if let Ok(docker) = crate::core::docker::connect() {
        if crate::core::docker::container_exists(&docker, &container).await {
            return ProviderKind::Docker;
        }
    }
    ProviderKind::Libvirt
}
