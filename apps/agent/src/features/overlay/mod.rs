//! Overlay endpoints: VXLAN tunnels, external interfaces, and the guarded
//! VXLAN port sweep.

use archetype_types::{
    ActionResponse, ExternalAttachRequest, ReconcilePortsRequest, ReconcilePortsResponse,
    TunnelCreateRequest, TunnelDeleteRequest,
};
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde_json::{json, Value};

use crate::config::settings;
use crate::core::iproute;

use super::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/overlay/tunnels", post(create_tunnel))
        .route("/overlay/tunnels/delete", post(delete_tunnel))
        .route("/overlay/external/attach", post(attach_external))
        .route("/overlay/external/detach", post(detach_external))
        .route("/overlay/reconcile-ports", post(reconcile_ports))
}

async fn create_tunnel(
    Extension(st): Extension<AppState>,
    Json(req): Json<TunnelCreateRequest>,
) -> Json<Value> {
    let local_ip = if req.local_ip.is_empty() {
        let configured = &settings().local_ip;
        if configured.is_empty() {
            iproute::detect_local_ip().await
        } else {
            configured.clone()
        }
    } else {
        req.local_ip.clone()
    };

    match st
        .plugin
        .create_vxlan_tunnel(&req.lab_id, &local_ip, &req.remote_ip, req.vni, req.vlan_tag)
        .await
    {
        Ok(port) => Json(json!({ "success": true, "port": port, "vni": req.vni })),
        Err(err) => Json(json!({ "success": false, "error": err.to_string() })),
    }
}

async fn delete_tunnel(
    Extension(st): Extension<AppState>,
    Json(req): Json<TunnelDeleteRequest>,
) -> Json<ActionResponse> {
    match st.plugin.delete_vxlan_tunnel(&req.lab_id, req.vni).await {
        Ok(true) => Json(ActionResponse::ok()),
        Ok(false) => Json(ActionResponse::err(format!(
            "no tunnel with VNI {} in lab {}",
            req.vni, req.lab_id
        ))),
        Err(err) => Json(ActionResponse::err(err.to_string())),
    }
}

async fn attach_external(
    Extension(st): Extension<AppState>,
    Json(req): Json<ExternalAttachRequest>,
) -> Json<Value> {
    match st
        .plugin
        .attach_external_interface(&req.lab_id, &req.interface, req.vlan_tag)
        .await
    {
        Ok(tag) => Json(json!({ "success": true, "vlan": tag })),
        Err(err) => Json(json!({ "success": false, "error": err.to_string() })),
    }
}

async fn detach_external(
    Extension(st): Extension<AppState>,
    Json(req): Json<ExternalAttachRequest>,
) -> Json<ActionResponse> {
    match st
        .plugin
        .detach_external_interface(&req.lab_id, &req.interface)
        .await
    {
        Ok(true) => Json(ActionResponse::ok()),
        Ok(false) => Json(ActionResponse::err(format!(
            "interface {} not attached to lab {}",
            req.interface, req.lab_id
        ))),
        Err(err) => Json(ActionResponse::err(err.to_string())),
    }
}

async fn reconcile_ports(
    Extension(st): Extension<AppState>,
    Json(req): Json<ReconcilePortsRequest>,
) -> Json<ReconcilePortsResponse> {
    match st
        .plugin
        .reconcile_overlay_ports(&req.valid_port_names, req.force, req.confirm, req.allow_empty)
        .await
    {
        Ok(deleted) => Json(ReconcilePortsResponse {
            success: true,
            deleted,
            error: None,
        }),
        Err(err) => Json(ReconcilePortsResponse {
            success: false,
            deleted: Vec::new(),
            error: Some(err.to_string()),
        }),
    }
}
