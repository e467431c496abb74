use serde::{Deserialize, Serialize};

/// Desired state of a node as recorded by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Running,
    Stopped,
}

/// Actual state of a node as observed/driven by agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Undeployed,
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Exited,
    Error,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Undeployed => "undeployed",
            NodeStatus::Pending => "pending",
            NodeStatus::Starting => "starting",
            NodeStatus::Running => "running",
            NodeStatus::Stopping => "stopping",
            NodeStatus::Stopped => "stopped",
            NodeStatus::Exited => "exited",
            NodeStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<NodeStatus> {
        match s {
            "undeployed" => Some(NodeStatus::Undeployed),
            "pending" => Some(NodeStatus::Pending),
            "starting" => Some(NodeStatus::Starting),
            "running" => Some(NodeStatus::Running),
            "stopping" => Some(NodeStatus::Stopping),
            "stopped" => Some(NodeStatus::Stopped),
            "exited" => Some(NodeStatus::Exited),
            "error" => Some(NodeStatus::Error),
            _ => None,
        }
    }
}

/// One endpoint of a link: a node name plus an interface on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEndpoint {
    pub node: String,
    pub interface: String,
}

impl LinkEndpoint {
    pub fn new(node: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            interface: interface.into(),
        }
    }

    fn key(&self) -> String {
        format!("{}:{}", self.node, self.interface)
    }
}

/// Canonical link name: `"node:iface-node:iface"` with endpoints sorted
/// lexicographically by their `"node:iface"` key. Symmetric in its inputs,
/// which makes it usable as a link identity.
pub fn canonical_link_name(a: &LinkEndpoint, b: &LinkEndpoint) -> String {
    let (first, second) = canonical_order(a, b);
    format!("{}-{}", first.key(), second.key())
}

/// Order two endpoints canonically (lexicographic by `"node:iface"`).
pub fn canonical_order<'a>(
    a: &'a LinkEndpoint,
    b: &'a LinkEndpoint,
) -> (&'a LinkEndpoint, &'a LinkEndpoint) {
    if a.key() <= b.key() {
        (a, b)
    } else {
        (b, a)
    }
}

/// Number of data interfaces an agent must pre-provision for a node:
/// max of the configured port count and the highest interface index any link
/// references, plus headroom, never below the minimum.
pub fn required_interface_count(max_ports: u32, max_linked_index: u32) -> u32 {
    let base = max_ports.max(max_linked_index);
    (base + 4).max(4)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyNodeSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub kind: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_config: Option<String>,
    /// Interface count resolved by the controller (links + UI maxPorts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_count: Option<u32>,
    /// Explicit host pin, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
}

impl TopologyNodeSpec {
    /// VM images are qcow2 disks; anything else is a container image.
    pub fn is_vm_image(&self) -> bool {
        self.image.ends_with(".qcow2")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyLinkSpec {
    pub endpoints: [LinkEndpoint; 2],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_id: Option<String>,
}

impl TopologyLinkSpec {
    pub fn canonical_name(&self) -> String {
        canonical_link_name(&self.endpoints[0], &self.endpoints[1])
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployTopology {
    pub lab_id: String,
    #[serde(default)]
    pub nodes: Vec<TopologyNodeSpec>,
    #[serde(default)]
    pub links: Vec<TopologyLinkSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub lab_id: String,
    pub topology: DeployTopology,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Error kinds agents report for expected deploy failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentErrorKind {
    MissingImage,
    AgentUnavailable,
    Validation,
    ResourceExhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingImage {
    pub node: String,
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDeployStatus {
    pub name: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<AgentErrorKind>,
    #[serde(default)]
    pub nodes: Vec<NodeDeployStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_images: Vec<MissingImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub is_ready: bool,
    #[serde(default)]
    pub ips: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessStatus {
    pub is_ready: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConnectRequest {
    pub link_id: String,
    pub endpoint_a: LinkEndpoint,
    pub endpoint_b: LinkEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConnectResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkDisconnectResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_vlan: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub target_vlan: u16,
}

/// Controller-allocated VNI range for cross-host tunnels.
pub const VNI_RANGE_START: u32 = 100_000;
pub const VNI_RANGE_END: u32 = 199_999;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelCreateRequest {
    pub lab_id: String,
    pub link_id: String,
    pub vni: u32,
    pub vlan_tag: u16,
    pub local_ip: String,
    pub remote_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelDeleteRequest {
    pub lab_id: String,
    pub vni: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalAttachRequest {
    pub lab_id: String,
    pub interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_tag: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilePortsRequest {
    #[serde(default)]
    pub valid_port_names: Vec<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub confirm: bool,
    #[serde(default)]
    pub allow_empty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilePortsResponse {
    pub success: bool,
    #[serde(default)]
    pub deleted: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityRequest {
    pub device_kinds: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityResponse {
    pub sufficient: bool,
    pub available_cpus: u32,
    pub available_mem_mb: u64,
    pub required_cpus: u32,
    pub required_mem_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageCheckResponse {
    #[serde(default)]
    pub present: Vec<String>,
    #[serde(default)]
    pub missing: Vec<String>,
    #[serde(default)]
    pub syncing: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgentRequest {
    pub agent_id: String,
    pub name: String,
    pub address: String,
    pub providers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfigRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfigResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_name_is_symmetric() {
        let a = LinkEndpoint::new("zzz", "eth1");
        let b = LinkEndpoint::new("aaa", "eth2");
        assert_eq!(canonical_link_name(&a, &b), canonical_link_name(&b, &a));
        assert_eq!(canonical_link_name(&a, &b), "aaa:eth2-zzz:eth1");
    }

    #[test]
    fn canonical_order_breaks_ties_on_interface() {
        let a = LinkEndpoint::new("n1", "eth2");
        let b = LinkEndpoint::new("n1", "eth1");
        let (first, second) = canonical_order(&a, &b);
        assert_eq!(first.interface, "eth1");
        assert_eq!(second.interface, "eth2");
    }

    #[test]
    fn interface_count_has_floor_and_headroom() {
        assert_eq!(required_interface_count(0, 0), 4);
        assert_eq!(required_interface_count(2, 0), 6);
        assert_eq!(required_interface_count(0, 7), 11);
        assert_eq!(required_interface_count(8, 3), 12);
    }

    #[test]
    fn vm_image_detection() {
        let mut node = TopologyNodeSpec {
            name: "r1".into(),
            display_name: None,
            kind: "cisco_n9kv".into(),
            image: "/images/n9kv.qcow2".into(),
            startup_config: None,
            interface_count: None,
            host_id: None,
        };
        assert!(node.is_vm_image());
        node.image = "ceos:4.32.0F".into();
        assert!(!node.is_vm_image());
    }

    #[test]
    fn node_status_round_trips_as_str() {
        for s in [
            NodeStatus::Undeployed,
            NodeStatus::Pending,
            NodeStatus::Starting,
            NodeStatus::Running,
            NodeStatus::Stopping,
            NodeStatus::Stopped,
            NodeStatus::Exited,
            NodeStatus::Error,
        ] {
            assert_eq!(NodeStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(NodeStatus::parse("bogus"), None);
    }
}
