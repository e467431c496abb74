//! Node providers: Docker for container images, libvirt/QEMU for `.qcow2`
//! disks. A flat trait plus a suffix-based factory; no hierarchy.

pub mod docker;
pub mod libvirt;
pub mod readiness;

use anyhow::Result;
use archetype_types::{
    DeployResponse, DeployTopology, NodeInfo, ReadinessStatus, TopologyLinkSpec, TopologyNodeSpec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Docker,
    Libvirt,
}

/// Pick the provider for a node by its image reference.
pub fn provider_for_image(image: &str) -> ProviderKind {
    if image.ends_with(".qcow2") {
        ProviderKind::Libvirt
    } else {
        ProviderKind::Docker
    }
}

#[allow(async_fn_in_trait)]
pub trait Provider {
    fn name(&self) -> &'static str;

    /// Deploy this provider's slice of a topology: networks, nodes, links.
    async fn deploy(&self, topology: &DeployTopology) -> Result<DeployResponse>;

    /// Remove every node and network the lab owns on this host.
    async fn destroy(&self, lab_id: &str) -> Result<()>;

    /// Actual state of the lab's nodes.
    async fn status(&self, lab_id: &str) -> Result<Vec<NodeInfo>>;

    /// Start an existing (previously deployed) node, repairing stale
    /// attachments and lost link tags.
    async fn start_node(
        &self,
        lab_id: &str,
        node: &TopologyNodeSpec,
        links: &[TopologyLinkSpec],
    ) -> Result<()>;

    async fn stop_node(&self, lab_id: &str, node_name: &str) -> Result<()>;

    /// Shell command a user would run to reach the node's console.
    async fn get_console_command(&self, lab_id: &str, node_name: &str) -> Result<String>;

    async fn check_readiness(
        &self,
        lab_id: &str,
        node_name: &str,
        kind: &str,
    ) -> Result<ReadinessStatus>;
}

/// Sanitize an identifier for use in container/domain/interface names.
pub fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_splits_on_qcow2_suffix() {
        assert_eq!(provider_for_image("/store/n9kv.qcow2"), ProviderKind::Libvirt);
        assert_eq!(provider_for_image("ceos:4.32.0F"), ProviderKind::Docker);
        assert_eq!(provider_for_image("alpine"), ProviderKind::Docker);
    }

    #[test]
    fn sanitize_replaces_awkward_chars() {
        assert_eq!(sanitize_name("lab 1/x"), "lab-1-x");
        assert_eq!(sanitize_name("spine_1.core"), "spine_1.core");
    }
}
