//! OVS-backed Docker network driver.
//!
//! Every Docker "network" created with this driver represents one container
//! interface. All of them share a single OVS bridge; isolation comes from
//! per-endpoint VLAN tags, and links are formed later by retagging. Veth
//! pairs are provisioned at CreateEndpoint time, before the container boots,
//! so interfaces exist when /sbin/init runs.

pub mod links;
pub mod overlay;
pub mod reconcile;
pub mod state;
pub mod vlan;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::Extension;
use axum::routing::post;
use axum::{Json, Router};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::settings;
use crate::core::{iproute, ovs};
use state::{EndpointState, LabBridge, ManagementNetwork, NetworkState, PluginTables};
use vlan::VlanAllocator;

pub const PLUGIN_NAME: &str = "archetype-ovs";

pub fn plugin_socket_path() -> String {
    format!("/run/docker/plugins/{PLUGIN_NAME}.sock")
}

pub fn plugin_spec_path() -> String {
    format!("/etc/docker/plugins/{PLUGIN_NAME}.spec")
}

pub struct Inner {
    pub tables: PluginTables,
    pub vlan: VlanAllocator,
}

pub struct OvsPlugin {
    pub bridge_name: String,
    state_path: PathBuf,
    veth_mtu: u32,
    pub vxlan_dst_port: u16,
    pub inner: Mutex<Inner>,
}

impl OvsPlugin {
    pub fn new() -> Self {
        let cfg = settings();
        Self {
            bridge_name: cfg.ovs_bridge_name.clone(),
            state_path: state::state_file_path(std::path::Path::new(&cfg.workspace_path)),
            veth_mtu: cfg.veth_mtu,
            vxlan_dst_port: cfg.vxlan_dst_port,
            inner: Mutex::new(Inner {
                tables: PluginTables {
                    next_mgmt_subnet_index: 1,
                    ..Default::default()
                },
                vlan: VlanAllocator::default(),
            }),
        }
    }

    /// Persist the snapshot. Called with the mutex held, after every
    /// mutation, so reads never observe a torn state on disk.
    pub async fn save_locked(&self, inner: &Inner) -> Result<()> {
        let snapshot = inner.tables.to_persisted(inner.vlan.next_pointer());
        let path = self.state_path.clone();
        tokio::task::spawn_blocking(move || state::save_snapshot(&path, &snapshot))
            .await
            .map_err(|err| anyhow!("snapshot writer panicked: {err}"))??;
        Ok(())
    }

    /// Load the snapshot and rebuild allocator bookkeeping. A corrupt file
    /// logs an error and the plugin starts empty; it never aborts startup.
    pub async fn load_state(&self) -> bool {
        let path = self.state_path.clone();
        let loaded = tokio::task::spawn_blocking(move || state::load_snapshot(&path)).await;
        let loaded = match loaded {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(err)) => {
                tracing::error!(error = %err, "failed to load plugin state, starting empty");
                return false;
            }
            Err(err) => {
                tracing::error!(error = %err, "snapshot loader panicked, starting empty");
                return false;
            }
        };
        let Some(persisted) = loaded else {
            return false;
        };

        let mut inner = self.inner.lock().await;
        inner.vlan = VlanAllocator::new(persisted.global_next_vlan);
        for endpoint in persisted.endpoints.values() {
            inner.vlan.mark_allocated(endpoint.vlan_tag);
        }
        for bridge in persisted.lab_bridges.values() {
            for tag in bridge.external_ports.values() {
                inner.vlan.mark_allocated(*tag);
            }
        }
        inner.tables.load_persisted(persisted);
        tracing::info!(
            bridges = inner.tables.lab_bridges.len(),
            endpoints = inner.tables.endpoints.len(),
            "loaded plugin state"
        );
        true
    }

    /// Allocate a VLAN tag that is free both in our books and live on the
    /// bridge.
    pub async fn allocate_vlan(&self, inner: &mut Inner) -> Result<u16> {
        let in_use = ovs::tags_in_use(&self.bridge_name).await.unwrap_or_default();
        inner
            .vlan
            .allocate(&in_use)
            .ok_or_else(|| anyhow!("VLAN range exhausted on {}", self.bridge_name))
    }

    /// Ensure the shared bridge exists and the lab has a bookkeeping row.
    pub async fn ensure_lab_bridge<'a>(
        &self,
        inner: &'a mut Inner,
        lab_id: &str,
    ) -> Result<&'a mut LabBridge> {
        if !ovs::bridge_exists(&self.bridge_name).await {
            ovs::ensure_bridge(&self.bridge_name).await?;
        }
        let bridge_name = self.bridge_name.clone();
        Ok(inner
            .tables
            .lab_bridges
            .entry(lab_id.to_string())
            .or_insert_with(|| LabBridge::new(lab_id, &bridge_name)))
    }

    fn generate_veth_names(endpoint_id: &str) -> (String, String) {
        let suffix: String = {
            let mut rng = rand::thread_rng();
            (0..6)
                .map(|_| {
                    let c = rng.gen_range(0..16u8);
                    char::from_digit(c as u32, 16).unwrap()
                })
                .collect()
        };
        let prefix: String = endpoint_id.chars().take(5).collect();
        let host = format!("vh{prefix}{suffix}");
        let cont = format!("vc{prefix}{suffix}");
        // Kernel interface names cap at 15 chars.
        (host[..host.len().min(15)].to_string(), cont[..cont.len().min(15)].to_string())
    }

    // -----------------------------------------------------------------
    // NetworkDriver protocol operations
    // -----------------------------------------------------------------

    pub async fn create_network(
        &self,
        network_id: &str,
        lab_id: &str,
        interface_name: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let bridge = self.ensure_lab_bridge(&mut inner, lab_id).await?;
        bridge.network_ids.insert(network_id.to_string());
        inner.tables.networks.insert(
            network_id.to_string(),
            NetworkState {
                network_id: network_id.to_string(),
                lab_id: lab_id.to_string(),
                interface_name: interface_name.to_string(),
                bridge_name: self.bridge_name.clone(),
            },
        );
        inner.tables.touch_lab(lab_id);
        self.save_locked(&inner).await?;
        tracing::info!(network_id, lab_id, interface_name, "created network");
        Ok(())
    }

    /// Drop the network registration. The shared bridge itself is never
    /// deleted; other labs and VXLAN tunnels use it.
    pub async fn delete_network(&self, network_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(net) = inner.tables.networks.remove(network_id) {
            if let Some(bridge) = inner.tables.lab_bridges.get_mut(&net.lab_id) {
                bridge.network_ids.remove(network_id);
            }
            self.save_locked(&inner).await?;
            tracing::info!(network_id, lab_id = %net.lab_id, "deleted network");
        }
        Ok(())
    }

    pub async fn create_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let net = inner
            .tables
            .networks
            .get(network_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown network {network_id}"))?;

        let (host_veth, cont_veth) = Self::generate_veth_names(endpoint_id);
        iproute::create_veth_pair(&host_veth, &cont_veth, self.veth_mtu).await?;

        let vlan_tag = match self.allocate_vlan(&mut inner).await {
            Ok(tag) => tag,
            Err(err) => {
                let _ = iproute::delete_link(&host_veth).await;
                return Err(err);
            }
        };
        if let Err(err) = ovs::add_port_with_tag(&self.bridge_name, &host_veth, vlan_tag).await {
            inner.vlan.release(vlan_tag);
            let _ = iproute::delete_link(&host_veth).await;
            return Err(err);
        }

        inner.tables.endpoints.insert(
            endpoint_id.to_string(),
            EndpointState {
                endpoint_id: endpoint_id.to_string(),
                network_id: network_id.to_string(),
                interface_name: net.interface_name.clone(),
                host_veth: host_veth.clone(),
                cont_veth,
                vlan_tag,
                container_name: None,
            },
        );
        inner.tables.touch_lab(&net.lab_id);
        self.save_locked(&inner).await?;
        tracing::info!(endpoint_id, host_veth, vlan_tag, "created endpoint");
        Ok(())
    }

    pub async fn delete_endpoint(&self, endpoint_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(ep) = inner.tables.endpoints.remove(endpoint_id) {
            ovs::del_port(&self.bridge_name, &ep.host_veth).await?;
            let _ = iproute::delete_link(&ep.host_veth).await;
            inner.vlan.release(ep.vlan_tag);
            self.save_locked(&inner).await?;
            tracing::info!(endpoint_id, host_veth = %ep.host_veth, "deleted endpoint");
        }
        Ok(())
    }

    /// Join: hand Docker the container-side veth. Docker moves it into the
    /// sandbox and names it `{DstPrefix}{N}`.
    pub async fn join(&self, endpoint_id: &str) -> Result<Value> {
        let inner = self.inner.lock().await;
        let ep = inner
            .tables
            .endpoints
            .get(endpoint_id)
            .ok_or_else(|| anyhow!("unknown endpoint {endpoint_id}"))?;
        Ok(json!({
            "InterfaceName": {
                "SrcName": ep.cont_veth,
                "DstPrefix": "eth",
            }
        }))
    }

    /// Record which container ended up owning an endpoint. Set by the
    /// provider after attach, used for discovery and reconnect queues.
    pub async fn set_endpoint_container(&self, endpoint_id: &str, container: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(ep) = inner.tables.endpoints.get_mut(endpoint_id) {
            ep.container_name = Some(container.to_string());
            self.save_locked(&inner).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Management networks
    // -----------------------------------------------------------------

    fn allocate_mgmt_subnet(tables: &mut PluginTables) -> (String, String) {
        let n = tables.next_mgmt_subnet_index;
        tables.next_mgmt_subnet_index += 1;
        (format!("172.30.{n}.0/24"), format!("172.30.{n}.1"))
    }

    /// Create the per-lab Docker bridge network every node attaches to as
    /// eth0 (DHCP/DNS come from Docker itself).
    pub async fn create_management_network(&self, lab_id: &str) -> Result<String> {
        use bollard::network::CreateNetworkOptions;
        let mut inner = self.inner.lock().await;
        if let Some(mgmt) = inner.tables.management_networks.get(lab_id) {
            return Ok(mgmt.network_name.clone());
        }
        let (subnet, gateway) = Self::allocate_mgmt_subnet(&mut inner.tables);
        let network_name = format!("archetype-mgmt-{}", &lab_id[..lab_id.len().min(12)]);

        let docker = crate::core::docker::connect()?;
        let create = docker
            .create_network(CreateNetworkOptions {
                name: network_name.as_str(),
                driver: "bridge",
                ipam: bollard::models::Ipam {
                    config: Some(vec![bollard::models::IpamConfig {
                        subnet: Some(subnet.clone()),
                        gateway: Some(gateway.clone()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await;
        match create {
            Ok(_) => {}
            // Already exists from a prior run; adopt it.
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 409, .. }) => {}
            Err(err) => return Err(err).context("failed to create management network"),
        }
        let network_id = docker
            .inspect_network::<String>(&network_name, None)
            .await
            .ok()
            .and_then(|n| n.id)
            .unwrap_or_else(|| network_name.clone());

        inner.tables.management_networks.insert(
            lab_id.to_string(),
            ManagementNetwork {
                lab_id: lab_id.to_string(),
                network_id,
                network_name: network_name.clone(),
                subnet,
                gateway,
            },
        );
        self.save_locked(&inner).await?;
        Ok(network_name)
    }

    pub async fn delete_management_network(&self, lab_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(mgmt) = inner.tables.management_networks.remove(lab_id) else {
            return Ok(false);
        };
        let docker = crate::core::docker::connect()?;
        if let Err(err) = docker.remove_network(&mgmt.network_name).await {
            tracing::warn!(network = %mgmt.network_name, error = %err, "failed to remove management network");
        }
        self.save_locked(&inner).await?;
        Ok(true)
    }

    // -----------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------

    /// Per-endpoint diagnostics for a lab: tracked tag vs the tag actually
    /// on the bridge, plus whether the veth still exists.
    pub async fn lab_ports(&self, lab_id: &str) -> Vec<Value> {
        let endpoints: Vec<state::EndpointState> = {
            let inner = self.inner.lock().await;
            inner
                .tables
                .endpoints
                .values()
                .filter(|ep| {
                    inner
                        .tables
                        .networks
                        .get(&ep.network_id)
                        .map(|net| net.lab_id == lab_id)
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        let mut ports = Vec::new();
        for ep in endpoints {
            let live_tag = ovs::get_port_tag(&ep.host_veth).await.ok().flatten();
            ports.push(json!({
                "container": ep.container_name,
                "interface": ep.interface_name,
                "host_veth": ep.host_veth,
                "tracked_vlan": ep.vlan_tag,
                "live_vlan": live_tag,
                "veth_present": iproute::link_exists_sys(&ep.host_veth),
            }));
        }
        ports
    }

    pub async fn status(&self) -> Value {
        let inner = self.inner.lock().await;
        json!({
            "bridge": self.bridge_name,
            "bridge_exists": ovs::bridge_exists(&self.bridge_name).await,
            "ovs_healthy": ovs::is_healthy().await,
            "labs": inner.tables.lab_bridges.len(),
            "networks": inner.tables.networks.len(),
            "endpoints": inner.tables.endpoints.len(),
            "next_vlan": inner.vlan.next_pointer(),
        })
    }

}

// ---------------------------------------------------------------------
// Docker plugin protocol (HTTP over the plugin Unix socket)
// ---------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateNetworkBody {
    #[serde(rename = "NetworkID")]
    network_id: String,
    #[serde(rename = "Options", default)]
    options: Option<HashMap<String, Value>>,
}

#[derive(Deserialize)]
struct NetworkIdBody {
    #[serde(rename = "NetworkID")]
    network_id: String,
}

#[derive(Deserialize)]
struct EndpointBody {
    #[serde(rename = "NetworkID")]
    #[allow(dead_code)]
    network_id: Option<String>,
    #[serde(rename = "EndpointID")]
    endpoint_id: String,
}

fn driver_err(message: impl std::fmt::Display) -> Json<Value> {
    Json(json!({ "Err": message.to_string() }))
}

/// Pull lab_id / interface_name out of the generic `-o` options Docker
/// forwards on network create.
fn generic_options(options: &Option<HashMap<String, Value>>) -> (Option<String>, Option<String>) {
    let generic = options
        .as_ref()
        .and_then(|o| o.get("com.docker.network.generic"));
    let get = |key: &str| {
        generic
            .and_then(|g| g.get(key))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    };
    (get("lab_id"), get("interface_name"))
}

async fn handle_activate() -> Json<Value> {
    Json(json!({ "Implements": ["NetworkDriver"] }))
}

async fn handle_capabilities() -> Json<Value> {
    Json(json!({ "Scope": "local", "ConnectivityScope": "local" }))
}

async fn handle_create_network(
    Extension(plugin): Extension<Arc<OvsPlugin>>,
    Json(body): Json<CreateNetworkBody>,
) -> Json<Value> {
    let (lab_id, interface_name) = generic_options(&body.options);
    let (Some(lab_id), Some(interface_name)) = (lab_id, interface_name) else {
        return driver_err("lab_id and interface_name options are required");
    };
    match plugin
        .create_network(&body.network_id, &lab_id, &interface_name)
        .await
    {
        Ok(()) => Json(json!({})),
        Err(err) => driver_err(err),
    }
}

async fn handle_delete_network(
    Extension(plugin): Extension<Arc<OvsPlugin>>,
    Json(body): Json<NetworkIdBody>,
) -> Json<Value> {
    match plugin.delete_network(&body.network_id).await {
        Ok(()) => Json(json!({})),
        Err(err) => driver_err(err),
    }
}

async fn handle_create_endpoint(
    Extension(plugin): Extension<Arc<OvsPlugin>>,
    Json(body): Json<EndpointBody>,
) -> Json<Value> {
    let network_id = match &body.network_id {
        Some(id) => id.clone(),
        None => return driver_err("NetworkID is required"),
    };
    match plugin.create_endpoint(&network_id, &body.endpoint_id).await {
        Ok(()) => Json(json!({ "Interface": {} })),
        Err(err) => driver_err(err),
    }
}

async fn handle_delete_endpoint(
    Extension(plugin): Extension<Arc<OvsPlugin>>,
    Json(body): Json<EndpointBody>,
) -> Json<Value> {
    match plugin.delete_endpoint(&body.endpoint_id).await {
        Ok(()) => Json(json!({})),
        Err(err) => driver_err(err),
    }
}

async fn handle_join(
    Extension(plugin): Extension<Arc<OvsPlugin>>,
    Json(body): Json<EndpointBody>,
) -> Json<Value> {
    match plugin.join(&body.endpoint_id).await {
        Ok(value) => Json(value),
        Err(err) => driver_err(err),
    }
}

async fn handle_noop() -> Json<Value> {
    Json(json!({}))
}

pub fn driver_router(plugin: Arc<OvsPlugin>) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(handle_activate))
        .route("/NetworkDriver.GetCapabilities", post(handle_capabilities))
        .route("/NetworkDriver.CreateNetwork", post(handle_create_network))
        .route("/NetworkDriver.DeleteNetwork", post(handle_delete_network))
        .route("/NetworkDriver.CreateEndpoint", post(handle_create_endpoint))
        .route("/NetworkDriver.DeleteEndpoint", post(handle_delete_endpoint))
        .route("/NetworkDriver.Join", post(handle_join))
        .route("/NetworkDriver.Leave", post(handle_noop))
        .route("/NetworkDriver.EndpointOperInfo", post(handle_noop))
        .route("/NetworkDriver.DiscoverNew", post(handle_noop))
        .route("/NetworkDriver.DiscoverDelete", post(handle_noop))
        .route(
            "/NetworkDriver.ProgramExternalConnectivity",
            post(handle_noop),
        )
        .route(
            "/NetworkDriver.RevokeExternalConnectivity",
            post(handle_noop),
        )
        .layer(Extension(plugin))
}

/// Serve the driver protocol on the plugin Unix socket and write the spec
/// file Docker uses to discover it.
pub async fn serve_unix(plugin: Arc<OvsPlugin>) -> Result<()> {
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use std::os::unix::fs::PermissionsExt;
    use tower::Service;

    let socket_path = plugin_socket_path();
    if let Some(parent) = std::path::Path::new(&socket_path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let _ = tokio::fs::remove_file(&socket_path).await;
    let listener = tokio::net::UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind plugin socket {socket_path}"))?;
    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o755))?;

    let spec_path = plugin_spec_path();
    if let Some(parent) = std::path::Path::new(&spec_path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&spec_path, format!("unix://{socket_path}")).await?;

    tracing::info!(socket = %socket_path, "docker plugin listening");
    let mut make_service = driver_router(plugin).into_make_service();
    loop {
        let (stream, _addr) = listener.accept().await?;
        let tower_service = match make_service.call(&stream).await {
            Ok(service) => service,
            Err(err) => match err {},
        };
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let hyper_service = hyper_util::service::TowerToHyperService::new(tower_service);
            if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection(io, hyper_service)
                .await
            {
                tracing::debug!(error = %err, "plugin connection error");
            }
        });
    }
}

/// Driver registration failure is fatal only for the standalone daemon; the
/// embedded agent logs and keeps serving its HTTP API.
pub fn spawn(plugin: Arc<OvsPlugin>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = serve_unix(plugin).await {
            tracing::error!(error = %err, "docker plugin server exited");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn veth_names_fit_kernel_limit() {
        let (host, cont) = OvsPlugin::generate_veth_names("0123456789abcdef");
        assert!(host.len() <= 15, "host veth too long: {host}");
        assert!(cont.len() <= 15, "cont veth too long: {cont}");
        assert!(host.starts_with("vh"));
        assert!(cont.starts_with("vc"));
        assert_eq!(&host[2..], &cont[2..]);
    }

    #[test]
    fn generic_options_extracts_labels() {
        let options: HashMap<String, Value> = serde_json::from_value(json!({
            "com.docker.network.generic": {
                "lab_id": "lab1",
                "interface_name": "eth3",
            }
        }))
        .unwrap();
        let (lab, iface) = generic_options(&Some(options));
        assert_eq!(lab.as_deref(), Some("lab1"));
        assert_eq!(iface.as_deref(), Some("eth3"));
        let (lab, iface) = generic_options(&None);
        assert!(lab.is_none() && iface.is_none());
    }

    #[test]
    fn mgmt_subnets_advance() {
        let mut tables = PluginTables {
            next_mgmt_subnet_index: 1,
            ..Default::default()
        };
        let (s1, g1) = OvsPlugin::allocate_mgmt_subnet(&mut tables);
        let (s2, _) = OvsPlugin::allocate_mgmt_subnet(&mut tables);
        assert_eq!(s1, "172.30.1.0/24");
        assert_eq!(g1, "172.30.1.1");
        assert_eq!(s2, "172.30.2.0/24");
    }
}
