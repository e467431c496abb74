//! Docker provider: container lifecycle and veth-backed networking on a
//! single host.

pub mod ceos;
pub mod extract;
pub mod interfaces;
pub mod networks;
pub mod nvram;
pub mod vlans;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use archetype_types::{
    AgentErrorKind, DeployResponse, DeployTopology, MissingImage, NodeDeployStatus, NodeInfo,
    NodeStatus, ReadinessStatus, TopologyLinkSpec, TopologyNodeSpec,
};
use bollard::container::{
    Config, ListContainersOptions, RemoveContainerOptions, StopContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;

use crate::config::settings;
use crate::core::docker as docker_core;
use crate::plugin::OvsPlugin;
use crate::providers::{sanitize_name, Provider};
use crate::vendors::is_ceos_kind;

pub const LABEL_LAB_ID: &str = "archetype.lab_id";
pub const LABEL_NODE_NAME: &str = "archetype.node_name";
pub const LABEL_NODE_DISPLAY_NAME: &str = "archetype.node_display_name";
pub const LABEL_NODE_KIND: &str = "archetype.node_kind";
pub const LABEL_PROVIDER: &str = "archetype.provider";

/// Delay between consecutive cEOS starts; parallel first boots race on
/// kernel module loading.
const CEOS_START_STAGGER: Duration = Duration::from_secs(5);

pub struct DockerProvider {
    docker: Docker,
    plugin: Arc<OvsPlugin>,
    workspace: PathBuf,
}

impl DockerProvider {
    pub fn new(plugin: Arc<OvsPlugin>) -> Result<Self> {
        Ok(Self {
            docker: docker_core::connect()?,
            plugin,
            workspace: PathBuf::from(&settings().workspace_path),
        })
    }

    /// Stable, uniquely decodable container name.
    pub fn container_name(lab_id: &str, node_name: &str) -> String {
        let lab: String = sanitize_name(lab_id).chars().take(20).collect();
        format!("archetype-{lab}-{}", sanitize_name(node_name))
    }

    fn lab_prefix(lab_id: &str) -> String {
        let lab: String = sanitize_name(lab_id).chars().take(20).collect();
        format!("archetype-{lab}-")
    }

    /// Container-image nodes only; `.qcow2` nodes belong to libvirt.
    fn container_nodes(topology: &DeployTopology) -> Vec<&TopologyNodeSpec> {
        topology.nodes.iter().filter(|n| !n.is_vm_image()).collect()
    }

    async fn validate_images(&self, nodes: &[&TopologyNodeSpec]) -> Vec<MissingImage> {
        let mut missing = Vec::new();
        let mut checked: HashMap<&str, bool> = HashMap::new();
        for node in nodes {
            let present = match checked.get(node.image.as_str()) {
                Some(present) => *present,
                None => {
                    let present = self.docker.inspect_image(&node.image).await.is_ok();
                    checked.insert(node.image.as_str(), present);
                    present
                }
            };
            if !present {
                missing.push(MissingImage {
                    node: node.name.clone(),
                    image: node.image.clone(),
                });
            }
        }
        missing
    }

    /// Recover stale per-lab VLAN allocations and prune entries whose
    /// containers no longer exist.
    async fn recover_vlan_allocations(&self, lab_id: &str) -> Result<()> {
        let Some(mut file) = vlans::load(&self.workspace, lab_id)? else {
            return Ok(());
        };
        let mut alive = HashSet::new();
        for container in file.allocations.keys() {
            if docker_core::container_exists(&self.docker, container).await {
                alive.insert(container.clone());
            }
        }
        let pruned = vlans::prune(&mut file, |name| alive.contains(name));
        if pruned > 0 {
            tracing::info!(lab_id, pruned, "pruned stale VLAN allocations");
        }
        {
            let mut inner = self.plugin.inner.lock().await;
            for ifaces in file.allocations.values() {
                for tag in ifaces.values() {
                    inner.vlan.mark_allocated(*tag);
                }
            }
        }
        vlans::save(&self.workspace, lab_id, &file)?;
        Ok(())
    }

    /// Snapshot the lab's current allocations for the next restart.
    async fn save_vlan_allocations(&self, lab_id: &str) -> Result<()> {
        let mut file = vlans::LabVlanFile::default();
        let inner = self.plugin.inner.lock().await;
        file.next_vlan = inner.vlan.next_pointer();
        for ep in inner.tables.endpoints.values() {
            let in_lab = inner
                .tables
                .networks
                .get(&ep.network_id)
                .map(|net| net.lab_id == lab_id)
                .unwrap_or(false);
            if !in_lab {
                continue;
            }
            if let Some(container) = &ep.container_name {
                file.allocations
                    .entry(container.clone())
                    .or_default()
                    .insert(ep.interface_name.clone(), ep.vlan_tag);
            }
        }
        drop(inner);
        vlans::save(&self.workspace, lab_id, &file)
    }

    fn build_container_config(
        &self,
        lab_id: &str,
        node: &TopologyNodeSpec,
        interface_count: u32,
        first_network: &str,
    ) -> Config<String> {
        let mut labels = HashMap::new();
        labels.insert(LABEL_LAB_ID.to_string(), lab_id.to_string());
        labels.insert(LABEL_NODE_NAME.to_string(), node.name.clone());
        if let Some(display) = &node.display_name {
            labels.insert(LABEL_NODE_DISPLAY_NAME.to_string(), display.clone());
        }
        labels.insert(LABEL_NODE_KIND.to_string(), node.kind.clone());
        labels.insert(LABEL_PROVIDER.to_string(), "docker".to_string());

        let mut env = Vec::new();
        let mut binds = Vec::new();
        let mut entrypoint = None;

        if is_ceos_kind(&node.kind) {
            for (key, value) in ceos::CEOS_ENV {
                env.push(format!("{key}={value}"));
            }
            env.push(format!("CLAB_INTFS={interface_count}"));
            let node_dir = self
                .workspace
                .join(lab_id)
                .join("configs")
                .join(&node.name);
            binds.push(format!("{}:/mnt/flash", node_dir.join("flash").display()));
            binds.push(format!(
                "{}:/etc/systemd/system.conf.d:ro",
                node_dir.join("systemd").display()
            ));
            entrypoint = Some(vec!["/mnt/flash/if-wait.sh".to_string()]);
        }

        Config {
            image: Some(node.image.clone()),
            hostname: Some(sanitize_name(node.display_name.as_deref().unwrap_or(&node.name))),
            env: Some(env),
            labels: Some(labels),
            entrypoint,
            host_config: Some(HostConfig {
                privileged: Some(true),
                binds: if binds.is_empty() { None } else { Some(binds) },
                network_mode: Some(first_network.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Record endpoint ownership in the plugin tables after attaching, so
    /// hot rewiring and reconciliation can find endpoints by container.
    async fn claim_endpoints(&self, container_name: &str) -> Result<()> {
        let inspect = self.docker.inspect_container(container_name, None).await?;
        let attachments = inspect
            .network_settings
            .and_then(|ns| ns.networks)
            .unwrap_or_default();
        for (_, attachment) in attachments {
            if let Some(endpoint_id) = attachment.endpoint_id {
                if !endpoint_id.is_empty() {
                    self.plugin
                        .set_endpoint_container(&endpoint_id, container_name)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Start a container, repairing stale network references once. Docker
    /// keeps attachments from prior deploys whose networks are gone; the
    /// repair disconnects everything lab-scoped and reconnects the current
    /// set before retrying.
    async fn start_with_repair(&self, lab_id: &str, container_name: &str) -> Result<()> {
        match self
            .docker
            .start_container::<String>(container_name, None)
            .await
        {
            Ok(()) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => {
                // Already started.
                return Ok(());
            }
            Err(err) => {
                let message = err.to_string();
                if !message.contains("network") {
                    return Err(err.into());
                }
                tracing::warn!(container = container_name, error = %message, "start failed, repairing network attachments");
            }
        }

        let nets = networks::list_lab_networks(&self.docker, lab_id).await?;
        for (name, _) in &nets {
            let _ = docker_core::disconnect_network(&self.docker, name, container_name).await;
        }
        for (name, _) in &nets {
            if let Err(err) =
                docker_core::connect_network(&self.docker, name, container_name).await
            {
                tracing::warn!(container = container_name, network = %name, error = %err, "reconnect failed");
            }
        }
        self.docker
            .start_container::<String>(container_name, None)
            .await
            .with_context(|| format!("failed to start {container_name} after network repair"))?;
        Ok(())
    }

    /// Connect links whose endpoints are both container nodes on this host.
    async fn connect_same_host_links(
        &self,
        lab_id: &str,
        links: &[TopologyLinkSpec],
        local_nodes: &HashSet<String>,
    ) -> Result<usize> {
        let mut connected = 0;
        for link in links {
            let [a, b] = &link.endpoints;
            if !local_nodes.contains(&a.node) || !local_nodes.contains(&b.node) {
                continue;
            }
            let container_a = Self::container_name(lab_id, &a.node);
            let container_b = Self::container_name(lab_id, &b.node);
            match self
                .plugin
                .hot_connect(lab_id, &container_a, &a.interface, &container_b, &b.interface)
                .await
            {
                Ok(_) => connected += 1,
                Err(err) => {
                    tracing::warn!(
                        lab_id,
                        link = %link.canonical_name(),
                        error = %err,
                        "failed to connect link"
                    );
                }
            }
        }
        Ok(connected)
    }

    async fn list_lab_containers(
        &self,
        lab_id: &str,
    ) -> Result<Vec<bollard::models::ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{LABEL_LAB_ID}={lab_id}")],
        );
        let mut by_label = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        // Label index skew happens; fall back to the name prefix and merge.
        let prefix = Self::lab_prefix(lab_id);
        let all = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;
        let seen: HashSet<String> = by_label
            .iter()
            .filter_map(|c| c.id.clone())
            .collect();
        for container in all {
            let named = container
                .names
                .as_ref()
                .map(|names| {
                    names
                        .iter()
                        .any(|n| n.trim_start_matches('/').starts_with(&prefix))
                })
                .unwrap_or(false);
            if named && !container.id.as_ref().map(|id| seen.contains(id)).unwrap_or(false) {
                by_label.push(container);
            }
        }
        Ok(by_label)
    }

    fn summary_status(summary: &bollard::models::ContainerSummary) -> NodeStatus {
        match summary.state.as_deref() {
            Some("running") => NodeStatus::Running,
            Some("created") => NodeStatus::Stopped,
            Some("exited") => NodeStatus::Exited,
            Some("paused") | Some("restarting") => NodeStatus::Starting,
            Some("dead") => NodeStatus::Error,
            _ => NodeStatus::Stopped,
        }
    }

    /// Management IP of a container, if it has one.
    pub async fn container_ip(&self, container_name: &str) -> Option<String> {
        let inspect = self.docker.inspect_container(container_name, None).await.ok()?;
        let nets = inspect.network_settings?.networks?;
        nets.values()
            .filter_map(|attachment| attachment.ip_address.clone())
            .find(|ip| !ip.is_empty())
    }

    /// Labs this agent knows about, discovered from container labels.
    pub async fn discover_labs(&self) -> Result<HashMap<String, Vec<NodeInfo>>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![LABEL_LAB_ID.to_string()]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut labs: HashMap<String, Vec<NodeInfo>> = HashMap::new();
        for summary in containers {
            let labels = summary.labels.clone().unwrap_or_default();
            let Some(lab_id) = labels.get(LABEL_LAB_ID) else {
                continue;
            };
            let name = labels
                .get(LABEL_NODE_NAME)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            labs.entry(lab_id.clone()).or_default().push(NodeInfo {
                name,
                status: Self::summary_status(&summary),
                is_ready: false,
                ips: Vec::new(),
            });
        }
        Ok(labs)
    }

    /// Stop containers whose labs are no longer valid (fallback cleanup for
    /// placements the controller lost track of).
    pub async fn cleanup_orphan_containers(&self, valid_lab_ids: &HashSet<String>) -> Result<Vec<String>> {
        let labs = self.discover_labs().await?;
        let mut stopped = Vec::new();
        for (lab_id, nodes) in labs {
            if valid_lab_ids.contains(&lab_id) {
                continue;
            }
            for node in nodes {
                let container = Self::container_name(&lab_id, &node.name);
                tracing::info!(lab_id, container = %container, "stopping orphan container");
                let _ = self
                    .docker
                    .stop_container(
                        &container,
                        Some(StopContainerOptions {
                            t: settings().container_stop_timeout_secs as i64,
                        }),
                    )
                    .await;
                stopped.push(container);
            }
        }
        Ok(stopped)
    }

    pub async fn images_present(&self, images: &[String]) -> (Vec<String>, Vec<String>) {
        let mut present = Vec::new();
        let mut missing = Vec::new();
        for image in images {
            if self.docker.inspect_image(image).await.is_ok() {
                present.push(image.clone());
            } else {
                missing.push(image.clone());
            }
        }
        (present, missing)
    }

    pub async fn extract_config(
        &self,
        lab_id: &str,
        node_name: &str,
        kind: &str,
    ) -> Result<String> {
        let container_name = Self::container_name(lab_id, node_name);
        let ip = self.container_ip(&container_name).await;
        extract::extract_node_config(
            &self.docker,
            &self.workspace,
            lab_id,
            node_name,
            &container_name,
            kind,
            ip.as_deref(),
        )
        .await
    }
}

impl Provider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn deploy(&self, topology: &DeployTopology) -> Result<DeployResponse> {
        let lab_id = &topology.lab_id;
        if topology.nodes.is_empty() {
            return Ok(DeployResponse {
                success: false,
                error: Some("topology has no nodes".into()),
                error_kind: Some(AgentErrorKind::Validation),
                ..Default::default()
            });
        }
        let nodes = Self::container_nodes(topology);
        if nodes.is_empty() {
            return Ok(DeployResponse {
                success: true,
                ..Default::default()
            });
        }

        // All images must exist before anything is touched; a partial
        // deploy leaves the lab half-built with no record of why.
        let missing = self.validate_images(&nodes).await;
        if !missing.is_empty() {
            return Ok(DeployResponse {
                success: false,
                error: Some(format!("{} images missing on this host", missing.len())),
                error_kind: Some(AgentErrorKind::MissingImage),
                missing_images: missing,
                ..Default::default()
            });
        }

        self.recover_vlan_allocations(lab_id).await?;

        for node in &nodes {
            if is_ceos_kind(&node.kind) {
                let workspace = self.workspace.clone();
                let lab = lab_id.clone();
                let name = node.name.clone();
                let display = node.display_name.clone();
                let startup = node.startup_config.clone();
                tokio::task::spawn_blocking(move || {
                    ceos::setup_ceos_directories(
                        &workspace,
                        &lab,
                        &name,
                        display.as_deref(),
                        startup.as_deref(),
                    )
                })
                .await
                .map_err(|err| anyhow!("artifact writer panicked: {err}"))??;
            }
        }

        let mgmt_network = self.plugin.create_management_network(lab_id).await?;

        // One network per interface, sized to the widest node.
        let iface_counts: HashMap<String, u32> = nodes
            .iter()
            .map(|node| (node.name.clone(), interfaces::interface_count_for(topology, &node.name)))
            .collect();
        let max_count = iface_counts.values().copied().max().unwrap_or(4);
        networks::create_lab_networks(&self.docker, lab_id, max_count).await?;

        let mut statuses = Vec::new();
        let mut started_names = Vec::new();
        let mut first_ceos_started = false;

        for node in &nodes {
            let container_name = Self::container_name(lab_id, &node.name);
            let count = iface_counts[&node.name];

            // Keep running containers; recreate stopped ones so config and
            // attachments are fresh.
            let existing = self.docker.inspect_container(&container_name, None).await.ok();
            let keep = existing
                .as_ref()
                .and_then(|inspect| inspect.state.as_ref())
                .map(|state| state.running == Some(true))
                .unwrap_or(false);
            if keep {
                statuses.push(NodeDeployStatus {
                    name: node.name.clone(),
                    status: NodeStatus::Running,
                    message: Some("already running".into()),
                });
                started_names.push((node.name.clone(), container_name));
                continue;
            }
            if existing.is_some() {
                self.docker
                    .remove_container(
                        &container_name,
                        Some(RemoveContainerOptions {
                            force: true,
                            v: true,
                            ..Default::default()
                        }),
                    )
                    .await
                    .with_context(|| format!("failed to remove stale {container_name}"))?;
            }

            // Created attached to eth1 via the plugin driver so at least one
            // data interface exists before /sbin/init; the rest attach
            // before start.
            let first_network = networks::lab_network_name(lab_id, "eth1");
            let config = self.build_container_config(lab_id, node, count, &first_network);
            self.docker
                .create_container(
                    Some(bollard::container::CreateContainerOptions {
                        name: container_name.clone(),
                        platform: None,
                    }),
                    config,
                )
                .await
                .with_context(|| format!("failed to create {container_name}"))?;

            docker_core::connect_network(&self.docker, &mgmt_network, &container_name).await?;
            for index in 2..=count {
                let net_name = networks::lab_network_name(lab_id, &format!("eth{index}"));
                docker_core::connect_network(&self.docker, &net_name, &container_name).await?;
            }

            if is_ceos_kind(&node.kind) && first_ceos_started {
                tokio::time::sleep(CEOS_START_STAGGER).await;
            }
            self.start_with_repair(lab_id, &container_name).await?;
            if is_ceos_kind(&node.kind) {
                first_ceos_started = true;
            }
            // Endpoint IDs only materialize once the sandbox exists; claim
            // after start so hot rewiring can find them by container.
            self.claim_endpoints(&container_name).await?;

            statuses.push(NodeDeployStatus {
                name: node.name.clone(),
                status: NodeStatus::Running,
                message: None,
            });
            started_names.push((node.name.clone(), container_name));
        }

        // Docker's attach-order interface naming is wrong more often than
        // not; normalize before links are formed.
        for (_, container_name) in &started_names {
            let _ = interfaces::fix_interface_names(&self.plugin, &self.docker, container_name)
                .await;
        }

        let local_nodes: HashSet<String> =
            started_names.iter().map(|(name, _)| name.clone()).collect();
        self.connect_same_host_links(lab_id, &topology.links, &local_nodes)
            .await?;

        for node in &nodes {
            self.spawn_readiness_watch(lab_id, &node.name, &node.kind);
        }

        self.save_vlan_allocations(lab_id).await?;

        Ok(DeployResponse {
            success: true,
            nodes: statuses,
            ..Default::default()
        })
    }

    async fn destroy(&self, lab_id: &str) -> Result<()> {
        for summary in self.list_lab_containers(lab_id).await? {
            let Some(id) = summary.id else { continue };
            if let Err(err) = self
                .docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                tracing::warn!(container = %id, error = %err, "failed to remove container");
            }
        }
        networks::delete_lab_networks(&self.docker, lab_id).await?;
        self.plugin.full_lab_cleanup(lab_id).await?;
        vlans::remove(&self.workspace, lab_id);
        tracing::info!(lab_id, "destroyed lab");
        Ok(())
    }

    async fn status(&self, lab_id: &str) -> Result<Vec<NodeInfo>> {
        let mut infos = Vec::new();
        for summary in self.list_lab_containers(lab_id).await? {
            let labels = summary.labels.clone().unwrap_or_default();
            let Some(name) = labels.get(LABEL_NODE_NAME).cloned() else {
                continue;
            };
            let container_name = Self::container_name(lab_id, &name);
            let ips = self
                .container_ip(&container_name)
                .await
                .map(|ip| vec![ip])
                .unwrap_or_default();
            infos.push(NodeInfo {
                name,
                status: Self::summary_status(&summary),
                is_ready: false,
                ips,
            });
        }
        Ok(infos)
    }

    async fn start_node(
        &self,
        lab_id: &str,
        node: &TopologyNodeSpec,
        links: &[TopologyLinkSpec],
    ) -> Result<()> {
        let container_name = Self::container_name(lab_id, &node.name);
        self.start_with_repair(lab_id, &container_name).await?;
        self.claim_endpoints(&container_name).await?;
        let _ = interfaces::fix_interface_names(&self.plugin, &self.docker, &container_name).await;

        // VLAN tags set while the peer was down are lost on stop; reconnect
        // every same-host link touching this node.
        let mut local_nodes = HashSet::new();
        local_nodes.insert(node.name.clone());
        for link in links {
            for ep in &link.endpoints {
                let peer = Self::container_name(lab_id, &ep.node);
                let peer_running = docker_core::container_pid(&self.docker, &peer)
                    .await
                    .ok()
                    .flatten()
                    .is_some();
                if peer_running {
                    local_nodes.insert(ep.node.clone());
                }
            }
        }
        self.connect_same_host_links(lab_id, links, &local_nodes).await?;
        self.spawn_readiness_watch(lab_id, &node.name, &node.kind);
        Ok(())
    }

    async fn stop_node(&self, lab_id: &str, node_name: &str) -> Result<()> {
        let container_name = Self::container_name(lab_id, node_name);
        match self
            .docker
            .stop_container(
                &container_name,
                Some(StopContainerOptions {
                    t: settings().container_stop_timeout_secs as i64,
                }),
            )
            .await
        {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => {}
            Err(err) => return Err(err.into()),
        }
        // Post-boot commands re-run on the next start.
        extract::clear_post_boot_cache(&container_name);
        Ok(())
    }

    async fn get_console_command(&self, lab_id: &str, node_name: &str) -> Result<String> {
        let container_name = Self::container_name(lab_id, node_name);
        let inspect = self
            .docker
            .inspect_container(&container_name, None)
            .await
            .map_err(|_| anyhow!("container {container_name} not found"))?;
        let kind = inspect
            .config
            .and_then(|config| config.labels)
            .and_then(|labels| labels.get(LABEL_NODE_KIND).cloned())
            .unwrap_or_default();
        let shell = if is_ceos_kind(&kind) { "Cli" } else { "sh" };
        Ok(format!("docker exec -it {container_name} {shell}"))
    }

    async fn check_readiness(
        &self,
        lab_id: &str,
        node_name: &str,
        kind: &str,
    ) -> Result<ReadinessStatus> {
        let container_name = Self::container_name(lab_id, node_name);
        super::readiness::check_container(&self.docker, &container_name, kind).await
    }
}

impl DockerProvider {
    /// Poll readiness in the background until the device finishes booting,
    /// then run its post-boot commands once.
    fn spawn_readiness_watch(&self, lab_id: &str, node_name: &str, kind: &str) {
        let vendor = crate::vendors::vendor_config(kind);
        if vendor.probe == crate::vendors::ProbeKind::None
            && vendor.post_boot_commands.is_empty()
        {
            return;
        }
        let docker = self.docker.clone();
        let container = Self::container_name(lab_id, node_name);
        let kind = kind.to_string();
        let timeout = Duration::from_secs(vendor.readiness_timeout_secs);
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                match super::readiness::check_container(&docker, &container, &kind).await {
                    Ok(status) if status.is_ready => {
                        if let Err(err) =
                            extract::run_post_boot_commands(&docker, &container, &kind).await
                        {
                            tracing::warn!(container = %container, error = %err, "post-boot commands failed");
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(container = %container, error = %err, "readiness probe error");
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    tracing::warn!(container = %container, "readiness deadline passed, giving up");
                    break;
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    /// Remove one node's container (force, with anonymous volumes).
    pub async fn destroy_node(&self, lab_id: &str, node_name: &str) -> Result<()> {
        let container_name = Self::container_name(lab_id, node_name);
        match self
            .docker
            .remove_container(
                &container_name,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_are_stable_and_bounded() {
        let name = DockerProvider::container_name(
            "0123456789abcdefghijKLMNOP",
            "spine 1",
        );
        assert_eq!(name, "archetype-0123456789abcdefghij-spine-1");
        // Deterministic
        assert_eq!(
            name,
            DockerProvider::container_name("0123456789abcdefghijKLMNOP", "spine 1")
        );
    }

    #[test]
    fn lab_prefix_matches_container_names() {
        let name = DockerProvider::container_name("lab1", "r1");
        assert!(name.starts_with(&DockerProvider::lab_prefix("lab1")));
    }

    #[test]
    fn container_nodes_excludes_vm_images() {
        let topo = DeployTopology {
            lab_id: "lab1".into(),
            nodes: vec![
                TopologyNodeSpec {
                    name: "c1".into(),
                    display_name: None,
                    kind: "ceos".into(),
                    image: "ceos:4.32".into(),
                    startup_config: None,
                    interface_count: None,
                    host_id: None,
                },
                TopologyNodeSpec {
                    name: "v1".into(),
                    display_name: None,
                    kind: "cisco_n9kv".into(),
                    image: "/store/n9kv.qcow2".into(),
                    startup_config: None,
                    interface_count: None,
                    host_id: None,
                },
            ],
            links: vec![],
        };
        let nodes = DockerProvider::container_nodes(&topo);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "c1");
    }
}
