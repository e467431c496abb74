//! Libvirt/QEMU provider for `.qcow2` devices, driven through `virsh` and
//! `qemu-img` subprocesses.

pub mod poap;
pub mod xml;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use archetype_types::{
    AgentErrorKind, DeployResponse, DeployTopology, MissingImage, NodeDeployStatus, NodeInfo,
    NodeStatus, ReadinessStatus, TopologyLinkSpec, TopologyNodeSpec,
};

use crate::config::settings;
use crate::core::cmd;
use crate::plugin::OvsPlugin;
use crate::providers::{readiness, sanitize_name, Provider};
use crate::vendors::{vendor_config, ProbeKind};

use xml::{DiskSpec, DomainSpec, EfiMode, NicAttachment, NicSpec};

pub struct LibvirtProvider {
    plugin: Arc<OvsPlugin>,
    workspace: PathBuf,
}

impl LibvirtProvider {
    pub fn new(plugin: Arc<OvsPlugin>) -> Self {
        Self {
            plugin,
            workspace: PathBuf::from(&settings().workspace_path),
        }
    }

    pub fn domain_name(lab_id: &str, node_name: &str) -> String {
        let lab: String = sanitize_name(lab_id).chars().take(20).collect();
        let node: String = sanitize_name(node_name).chars().take(30).collect();
        format!("arch-{lab}-{node}")
    }

    fn domain_prefix(lab_id: &str) -> String {
        let lab: String = sanitize_name(lab_id).chars().take(20).collect();
        format!("arch-{lab}-")
    }

    async fn virsh(args: &[&str]) -> Result<(i32, String, String)> {
        let uri = &settings().libvirt_uri;
        let mut full = vec!["-c", uri.as_str()];
        full.extend_from_slice(args);
        cmd::run("virsh", &full).await
    }

    async fn virsh_checked(args: &[&str]) -> Result<String> {
        let (code, stdout, stderr) = Self::virsh(args).await?;
        if code != 0 {
            bail!("virsh {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(stdout)
    }

    /// Resolve a node's base image to a host-visible path. The controller
    /// may hand us a container-visible path; translate via the configured
    /// host image prefix, then fall back to the qcow2 store.
    pub fn resolve_base_image(&self, image: &str) -> PathBuf {
        let cfg = settings();
        let path = Path::new(image);
        if path.is_absolute() {
            if path.exists() {
                return path.to_path_buf();
            }
            if !cfg.host_image_path.is_empty() {
                // Translate /qcow2-store/foo.qcow2 -> {host_image_path}/foo.qcow2
                if let Some(file_name) = path.file_name() {
                    let translated = Path::new(&cfg.host_image_path).join(file_name);
                    if translated.exists() {
                        return translated;
                    }
                }
            }
            return path.to_path_buf();
        }
        Path::new(&cfg.qcow2_store_path).join(image)
    }

    fn overlay_path(&self, lab_id: &str, node_name: &str) -> PathBuf {
        self.workspace
            .join(lab_id)
            .join("disks")
            .join(format!("{}.qcow2", sanitize_name(node_name)))
    }

    async fn create_overlay(&self, base: &Path, overlay: &Path) -> Result<()> {
        if let Some(parent) = overlay.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if overlay.exists() {
            return Ok(());
        }
        let base_s = base.display().to_string();
        let overlay_s = overlay.display().to_string();
        cmd::run_checked(
            "qemu-img",
            &[
                "create", "-F", "qcow2", "-f", "qcow2", "-b", &base_s, &overlay_s,
            ],
        )
        .await
        .with_context(|| format!("failed to create overlay {overlay_s}"))?;
        Ok(())
    }

    async fn create_data_volume(&self, path: &Path, size_gb: u32) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path_s = path.display().to_string();
        cmd::run_checked(
            "qemu-img",
            &["create", "-f", "qcow2", &path_s, &format!("{size_gb}G")],
        )
        .await?;
        Ok(())
    }

    /// Define (or reuse) the node's POAP NAT network and return its name.
    async fn ensure_poap_network(&self, lab_id: &str, node_name: &str) -> Result<String> {
        let name = poap::poap_network_name(lab_id, node_name);
        let (code, stdout, _) = Self::virsh(&["net-list", "--all", "--name"]).await?;
        if code == 0 && stdout.lines().any(|l| l.trim() == name) {
            let _ = Self::virsh(&["net-start", &name]).await;
            return Ok(name);
        }
        // Derive a subnet octet from the network name so parallel nodes do
        // not collide.
        let octet = {
            use sha2::{Digest, Sha256};
            let digest = Sha256::digest(name.as_bytes());
            // 100..=250 keeps clear of the libvirt default 122 only by luck;
            // collisions just mean dnsmasq refuses to start and deploy fails
            // loudly.
            100 + (digest[0] % 150)
        };
        let cfg = settings();
        let agent_ip = if cfg.local_ip.is_empty() {
            crate::core::iproute::detect_local_ip().await
        } else {
            cfg.local_ip.clone()
        };
        let net_xml = poap::poap_network_xml(lab_id, node_name, octet, &agent_ip, cfg.agent_port);
        let xml_path = self.workspace.join(lab_id).join(format!("{name}.xml"));
        if let Some(parent) = xml_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&xml_path, &net_xml).await?;
        let xml_path_s = xml_path.display().to_string();
        Self::virsh_checked(&["net-define", &xml_path_s]).await?;
        Self::virsh_checked(&["net-start", &name]).await?;
        let _ = Self::virsh(&["net-autostart", &name]).await;
        Ok(name)
    }

    async fn deploy_node(&self, lab_id: &str, node: &TopologyNodeSpec, iface_count: u32) -> Result<()> {
        let vendor = vendor_config(&node.kind);
        let domain = Self::domain_name(lab_id, &node.name);

        let base = self.resolve_base_image(&node.image);
        if !base.exists() {
            bail!("base image {} not found", base.display());
        }
        let overlay = self.overlay_path(lab_id, &node.name);
        self.create_overlay(&base, &overlay).await?;

        let mut disks = vec![DiskSpec {
            path: overlay.display().to_string(),
            bus: vendor.disk_bus.to_string(),
            target_dev: if vendor.disk_bus == "virtio" { "vda" } else { "sda" }.to_string(),
        }];
        if vendor.data_volume_gb > 0 {
            let data_path = self
                .workspace
                .join(lab_id)
                .join("disks")
                .join(format!("{}-data.qcow2", sanitize_name(&node.name)));
            self.create_data_volume(&data_path, vendor.data_volume_gb).await?;
            disks.push(DiskSpec {
                path: data_path.display().to_string(),
                bus: vendor.disk_bus.to_string(),
                target_dev: if vendor.disk_bus == "virtio" { "vdb" } else { "sdb" }.to_string(),
            });
        }

        let mut nics = Vec::new();
        if vendor.needs_mgmt_nic {
            // Interface index 0 is reserved for management; data-plane
            // indices shift by one.
            let network = if vendor.poap_enabled {
                self.ensure_poap_network(lab_id, &node.name).await?
            } else {
                "default".to_string()
            };
            nics.push(NicSpec {
                model: vendor.nic_model.to_string(),
                attachment: NicAttachment::Network { network },
            });
        }
        for _ in 0..iface_count {
            let vlan_tag = {
                let mut inner = self.plugin.inner.lock().await;
                self.plugin.allocate_vlan(&mut inner).await?
            };
            nics.push(NicSpec {
                model: vendor.nic_model.to_string(),
                attachment: NicAttachment::OvsBridge {
                    bridge: self.plugin.bridge_name.clone(),
                    vlan_tag,
                },
            });
        }

        let (efi, ovmf_code, ovmf_vars) = if vendor.efi_boot {
            let (code, vars) = xml::detect_ovmf_paths();
            let mode = if vendor.efi_stateless {
                EfiMode::Stateless
            } else {
                EfiMode::Stateful
            };
            (mode, code, vars)
        } else {
            (EfiMode::None, None, None)
        };

        let spec = DomainSpec {
            name: domain.clone(),
            driver: "kvm".into(),
            machine: vendor.machine_type.to_string(),
            vcpus: vendor.vcpus.max(1),
            memory_mb: vendor.memory_mb.max(512),
            disks,
            nics,
            efi,
            ovmf_code_path: ovmf_code,
            ovmf_vars_template: ovmf_vars,
            cpu_limit: vendor.cpu_limit,
            device_kind: node.kind.clone(),
            probe_kind: match vendor.probe {
                ProbeKind::None => "none",
                ProbeKind::LogPattern => "log_pattern",
                ProbeKind::CliProbe => "cli_probe",
                ProbeKind::Ssh => "ssh",
            }
            .to_string(),
            probe_pattern: vendor.readiness_pattern.to_string(),
            probe_timeout_secs: vendor.readiness_timeout_secs,
        };
        let domain_xml = xml::generate_domain_xml(&spec)?;

        let xml_path = self
            .workspace
            .join(lab_id)
            .join("domains")
            .join(format!("{}.xml", sanitize_name(&node.name)));
        if let Some(parent) = xml_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&xml_path, &domain_xml).await?;

        let xml_path_s = xml_path.display().to_string();
        Self::virsh_checked(&["define", &xml_path_s]).await?;
        let (code, _, stderr) = Self::virsh(&["start", &domain]).await?;
        if code != 0 && !stderr.contains("already active") {
            bail!("failed to start domain {domain}: {}", stderr.trim());
        }
        tracing::info!(lab_id, node = %node.name, domain = %domain, "deployed VM");
        Ok(())
    }

    async fn list_lab_domains(lab_id: &str) -> Result<Vec<String>> {
        let prefix = Self::domain_prefix(lab_id);
        let stdout = Self::virsh_checked(&["list", "--all", "--name"]).await?;
        Ok(stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| l.starts_with(&prefix))
            .collect())
    }

    async fn domain_state(domain: &str) -> NodeStatus {
        match Self::virsh(&["domstate", domain]).await {
            Ok((0, stdout, _)) => match stdout.trim() {
                "running" => NodeStatus::Running,
                "paused" => NodeStatus::Starting,
                "shut off" => NodeStatus::Stopped,
                "crashed" => NodeStatus::Error,
                "in shutdown" => NodeStatus::Stopping,
                _ => NodeStatus::Stopped,
            },
            _ => NodeStatus::Undeployed,
        }
    }

    /// Undefine with the NVRAM fallback: an EFI-backed domain rejects a
    /// plain undefine.
    async fn undefine_domain(domain: &str) -> Result<()> {
        let (code, _, stderr) = Self::virsh(&["undefine", domain]).await?;
        if code == 0 {
            return Ok(());
        }
        if stderr.contains("nvram") || stderr.contains("NVRAM") {
            Self::virsh_checked(&["undefine", domain, "--nvram"]).await?;
            return Ok(());
        }
        bail!("failed to undefine {domain}: {}", stderr.trim());
    }

    /// Destroy and undefine one node's domain, tolerating absence.
    pub async fn destroy_node(&self, lab_id: &str, node_name: &str) -> Result<()> {
        let domain = Self::domain_name(lab_id, node_name);
        let _ = Self::virsh(&["destroy", &domain]).await;
        match Self::undefine_domain(&domain).await {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("failed to get domain") => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Poll SSH readiness in the background; once the device answers, run
    /// its post-boot console commands.
    fn spawn_readiness_watch(lab_id: &str, node_name: &str, kind: &str) {
        let vendor = vendor_config(kind);
        if vendor.post_boot_commands.is_empty() {
            return;
        }
        let domain = Self::domain_name(lab_id, node_name);
        let lab_id = lab_id.to_string();
        let node_name = node_name.to_string();
        let kind = kind.to_string();
        let timeout = std::time::Duration::from_secs(vendor.readiness_timeout_secs);
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if Self::domain_state(&domain).await == NodeStatus::Running {
                    if let Some(ip) = Self::management_ip(&lab_id, &node_name).await {
                        if readiness::probe_ssh_port(&ip, 3).await {
                            if let Err(err) =
                                crate::console::extractor::run_vm_post_boot_commands(&domain, &kind)
                                    .await
                            {
                                tracing::warn!(domain = %domain, error = %err, "VM post-boot commands failed");
                            }
                            break;
                        }
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    tracing::warn!(domain = %domain, "VM readiness deadline passed, giving up");
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_secs(15)).await;
            }
        });
    }

    /// Management IP for a domain, from libvirt DHCP leases matched by the
    /// deterministic MAC of NIC 0.
    pub async fn management_ip(lab_id: &str, node_name: &str) -> Option<String> {
        let domain = Self::domain_name(lab_id, node_name);
        let mac = xml::deterministic_mac(&domain, 0);
        let networks = [
            poap::poap_network_name(lab_id, node_name),
            "default".to_string(),
        ];
        for network in networks {
            let Ok((0, stdout, _)) = Self::virsh(&["net-dhcp-leases", &network]).await else {
                continue;
            };
            for line in stdout.lines() {
                if line.to_ascii_lowercase().contains(&mac) {
                    // Lease line: expiry  mac  protocol  ip/prefix  hostname ...
                    if let Some(ip_field) = line.split_whitespace().nth(4) {
                        return Some(ip_field.split('/').next().unwrap_or(ip_field).to_string());
                    }
                }
            }
        }
        None
    }
}

impl Provider for LibvirtProvider {
    fn name(&self) -> &'static str {
        "libvirt"
    }

    async fn deploy(&self, topology: &DeployTopology) -> Result<DeployResponse> {
        let lab_id = &topology.lab_id;
        let nodes: Vec<&TopologyNodeSpec> =
            topology.nodes.iter().filter(|n| n.is_vm_image()).collect();
        if nodes.is_empty() {
            return Ok(DeployResponse {
                success: true,
                ..Default::default()
            });
        }

        let mut missing = Vec::new();
        for node in &nodes {
            if !self.resolve_base_image(&node.image).exists() {
                missing.push(MissingImage {
                    node: node.name.clone(),
                    image: node.image.clone(),
                });
            }
        }
        if !missing.is_empty() {
            return Ok(DeployResponse {
                success: false,
                error: Some(format!("{} qcow2 images missing on this host", missing.len())),
                error_kind: Some(AgentErrorKind::MissingImage),
                missing_images: missing,
                ..Default::default()
            });
        }

        let mut statuses = Vec::new();
        for node in &nodes {
            let iface_count =
                super::docker::interfaces::interface_count_for(topology, &node.name);
            match self.deploy_node(lab_id, node, iface_count).await {
                Ok(()) => {
                    Self::spawn_readiness_watch(lab_id, &node.name, &node.kind);
                    statuses.push(NodeDeployStatus {
                        name: node.name.clone(),
                        status: NodeStatus::Running,
                        message: None,
                    });
                }
                Err(err) => statuses.push(NodeDeployStatus {
                    name: node.name.clone(),
                    status: NodeStatus::Error,
                    message: Some(err.to_string()),
                }),
            }
        }
        let success = statuses.iter().all(|s| s.status != NodeStatus::Error);
        Ok(DeployResponse {
            success,
            nodes: statuses,
            ..Default::default()
        })
    }

    async fn destroy(&self, lab_id: &str) -> Result<()> {
        for domain in Self::list_lab_domains(lab_id).await? {
            let _ = Self::virsh(&["destroy", &domain]).await;
            if let Err(err) = Self::undefine_domain(&domain).await {
                tracing::warn!(domain = %domain, error = %err, "undefine failed");
            }
        }
        // POAP networks for this lab.
        let prefix = format!("ap-poap-{}", &lab_id[..lab_id.len().min(12)]);
        if let Ok((0, stdout, _)) = Self::virsh(&["net-list", "--all", "--name"]).await {
            for net in stdout.lines().map(str::trim).filter(|l| l.starts_with(&prefix)) {
                let _ = Self::virsh(&["net-destroy", net]).await;
                let _ = Self::virsh(&["net-undefine", net]).await;
            }
        }
        let disks_dir = self.workspace.join(lab_id).join("disks");
        if disks_dir.exists() {
            let _ = tokio::fs::remove_dir_all(&disks_dir).await;
        }
        tracing::info!(lab_id, "destroyed VM lab slice");
        Ok(())
    }

    async fn status(&self, lab_id: &str) -> Result<Vec<NodeInfo>> {
        let prefix = Self::domain_prefix(lab_id);
        let mut infos = Vec::new();
        for domain in Self::list_lab_domains(lab_id).await? {
            let name = domain.trim_start_matches(&prefix).to_string();
            let status = Self::domain_state(&domain).await;
            let ips = Self::management_ip(lab_id, &name)
                .await
                .map(|ip| vec![ip])
                .unwrap_or_default();
            infos.push(NodeInfo {
                name,
                status,
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
        _links: &[TopologyLinkSpec],
    ) -> Result<()> {
        let domain = Self::domain_name(lab_id, &node.name);
        let (code, _, stderr) = Self::virsh(&["start", &domain]).await?;
        if code != 0 && !stderr.contains("already active") {
            bail!("failed to start {domain}: {}", stderr.trim());
        }
        Self::spawn_readiness_watch(lab_id, &node.name, &node.kind);
        Ok(())
    }

    async fn stop_node(&self, lab_id: &str, node_name: &str) -> Result<()> {
        let domain = Self::domain_name(lab_id, node_name);
        let (code, _, stderr) = Self::virsh(&["shutdown", &domain]).await?;
        if code != 0 {
            if stderr.contains("not running") || stderr.contains("domain is not running") {
                return Ok(());
            }
            // Graceful shutdown refused; force it.
            let (code, _, stderr) = Self::virsh(&["destroy", &domain]).await?;
            if code != 0 && !stderr.contains("not running") {
                bail!("failed to stop {domain}: {}", stderr.trim());
            }
        }
        crate::console::extractor::clear_vm_post_boot_cache(&domain);
        Ok(())
    }

    async fn get_console_command(&self, lab_id: &str, node_name: &str) -> Result<String> {
        let domain = Self::domain_name(lab_id, node_name);
        let state = Self::domain_state(&domain).await;
        if state == NodeStatus::Undeployed {
            bail!("domain {domain} not defined");
        }
        Ok(format!("virsh console {domain} --force"))
    }

    async fn check_readiness(
        &self,
        lab_id: &str,
        node_name: &str,
        kind: &str,
    ) -> Result<ReadinessStatus> {
        let vendor = vendor_config(kind);
        let domain = Self::domain_name(lab_id, node_name);
        if Self::domain_state(&domain).await != NodeStatus::Running {
            return Ok(ReadinessStatus {
                is_ready: false,
                message: "Domain not running".into(),
                progress_percent: Some(0),
            });
        }
        match vendor.probe {
            ProbeKind::Ssh => {
                let Some(ip) = Self::management_ip(lab_id, node_name).await else {
                    return Ok(ReadinessStatus {
                        is_ready: false,
                        message: "Waiting for DHCP lease".into(),
                        progress_percent: Some(20),
                    });
                };
                if readiness::probe_ssh_port(&ip, 3).await {
                    Ok(ReadinessStatus {
                        is_ready: true,
                        message: format!("SSH reachable at {ip}"),
                        progress_percent: Some(100),
                    })
                } else {
                    Ok(ReadinessStatus {
                        is_ready: false,
                        message: format!("SSH not reachable at {ip} yet"),
                        progress_percent: Some(60),
                    })
                }
            }
            _ => Ok(ReadinessStatus {
                is_ready: true,
                message: "No VM probe configured".into(),
                progress_percent: Some(100),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_names_truncate_both_parts() {
        let name = LibvirtProvider::domain_name(
            "0123456789abcdefghijKLM",
            "a-node-name-well-beyond-thirty-characters",
        );
        assert_eq!(name, "arch-0123456789abcdefghij-a-node-name-well-beyond-thirty");
        assert!(name.starts_with(&LibvirtProvider::domain_prefix("0123456789abcdefghijKLM")));
    }
}
