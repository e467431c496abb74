//! Hot link endpoints: connect, disconnect, isolate, restore.

use archetype_types::{
    ActionResponse, LinkConnectRequest, LinkConnectResponse, LinkDisconnectResponse, LinkEndpoint,
    RestoreRequest,
};
use axum::extract::Path;
use axum::routing::{delete, post};
use axum::{Extension, Json, Router};

use crate::providers::docker::DockerProvider;

use super::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/labs/:lab/links", post(connect_link))
        .route("/labs/:lab/links/:link_id", delete(disconnect_link))
        .route(
            "/labs/:lab/endpoints/:node/:iface/vlan",
            axum::routing::get(endpoint_vlan),
        )
        .route("/labs/:lab/ports", axum::routing::get(lab_ports))
        .route(
            "/labs/:lab/interfaces/:node/:iface/isolate",
            post(isolate_interface),
        )
        .route(
            "/labs/:lab/interfaces/:node/:iface/restore",
            post(restore_interface),
        )
}

async fn connect_link(
    Extension(st): Extension<AppState>,
    Path(lab): Path<String>,
    Json(req): Json<LinkConnectRequest>,
) -> Json<LinkConnectResponse> {
    let container_a = DockerProvider::container_name(&lab, &req.endpoint_a.node);
    let container_b = DockerProvider::container_name(&lab, &req.endpoint_b.node);
    match st
        .plugin
        .hot_connect(
            &lab,
            &container_a,
            &req.endpoint_a.interface,
            &container_b,
            &req.endpoint_b.interface,
        )
        .await
    {
        Ok(vlan) => Json(LinkConnectResponse {
            success: true,
            vlan: Some(vlan),
            error: None,
        }),
        Err(err) => Json(LinkConnectResponse {
            success: false,
            vlan: None,
            error: Some(err.to_string()),
        }),
    }
}

/// Parse a canonical link id (`node:iface-node:iface`) back into endpoints.
pub fn parse_link_id(link_id: &str) -> Option<(LinkEndpoint, LinkEndpoint)> {
    // Node names may contain '-', interface names (ethN) do not: the
    // separator is the first '-' after the first endpoint's ':'.
    let colons: Vec<usize> = link_id
        .char_indices()
        .filter(|(_, c)| *c == ':')
        .map(|(i, _)| i)
        .collect();
    if colons.len() != 2 {
        return None;
    }
    let dash = colons[0] + link_id[colons[0]..].find('-')?;
    let first = &link_id[..dash];
    let second = &link_id[dash + 1..];
    let (node_a, iface_a) = first.split_once(':')?;
    let (node_b, iface_b) = second.split_once(':')?;
    if node_a.is_empty() || iface_a.is_empty() || node_b.is_empty() || iface_b.is_empty() {
        return None;
    }
    Some((
        LinkEndpoint::new(node_a, iface_a),
        LinkEndpoint::new(node_b, iface_b),
    ))
}

async fn disconnect_link(
    Extension(st): Extension<AppState>,
    Path((lab, link_id)): Path<(String, String)>,
) -> Json<LinkDisconnectResponse> {
    let Some((endpoint_a, _)) = parse_link_id(&link_id) else {
        return Json(LinkDisconnectResponse {
            success: false,
            new_vlan: None,
            error: Some(format!("malformed link id {link_id}")),
        });
    };
    let container = DockerProvider::container_name(&lab, &endpoint_a.node);
    match st
        .plugin
        .hot_disconnect(&lab, &container, &endpoint_a.interface)
        .await
    {
        Ok(new_vlan) => Json(LinkDisconnectResponse {
            success: true,
            new_vlan: Some(new_vlan),
            error: None,
        }),
        Err(err) => Json(LinkDisconnectResponse {
            success: false,
            new_vlan: None,
            error: Some(err.to_string()),
        }),
    }
}

async fn lab_ports(
    Extension(st): Extension<AppState>,
    Path(lab): Path<String>,
) -> Json<serde_json::Value> {
    let ports = st.plugin.lab_ports(&lab).await;
    Json(serde_json::json!({ "success": true, "ports": ports }))
}

async fn endpoint_vlan(
    Extension(st): Extension<AppState>,
    Path((lab, node, iface)): Path<(String, String, String)>,
) -> Json<serde_json::Value> {
    let container = DockerProvider::container_name(&lab, &node);
    match st.plugin.endpoint_vlan(&container, &iface).await {
        Some(vlan) => Json(serde_json::json!({ "success": true, "vlan": vlan })),
        None => Json(serde_json::json!({
            "success": false,
            "error": format!("no tracked endpoint for {node}:{iface}"),
        })),
    }
}

async fn isolate_interface(
    Extension(st): Extension<AppState>,
    Path((lab, node, iface)): Path<(String, String, String)>,
) -> Json<LinkDisconnectResponse> {
    let container = DockerProvider::container_name(&lab, &node);
    match st.plugin.isolate_port(&lab, &container, &iface).await {
        Ok(new_vlan) => Json(LinkDisconnectResponse {
            success: true,
            new_vlan: Some(new_vlan),
            error: None,
        }),
        Err(err) => Json(LinkDisconnectResponse {
            success: false,
            new_vlan: None,
            error: Some(err.to_string()),
        }),
    }
}

async fn restore_interface(
    Extension(st): Extension<AppState>,
    Path((lab, node, iface)): Path<(String, String, String)>,
    Json(req): Json<RestoreRequest>,
) -> Json<ActionResponse> {
    let container = DockerProvider::container_name(&lab, &node);
    match st
        .plugin
        .restore_port(&lab, &container, &iface, req.target_vlan)
        .await
    {
        Ok(()) => Json(ActionResponse::ok()),
        Err(err) => Json(ActionResponse::err(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_link_ids() {
        let (a, b) = parse_link_id("aaa:eth2-zzz:eth1").unwrap();
        assert_eq!(a.node, "aaa");
        assert_eq!(a.interface, "eth2");
        assert_eq!(b.node, "zzz");
        assert_eq!(b.interface, "eth1");
    }

    #[test]
    fn parses_dashed_node_names() {
        let (a, b) = parse_link_id("spine-1:eth1-tor-2:eth3").unwrap();
        assert_eq!(a.node, "spine-1");
        assert_eq!(b.node, "tor-2");
        assert_eq!(b.interface, "eth3");
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(parse_link_id("no-colons-here").is_none());
        assert!(parse_link_id("a:eth1").is_none());
        assert!(parse_link_id("a:eth1-").is_none());
    }
}
