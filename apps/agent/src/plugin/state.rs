//! Plugin state tables and their on-disk snapshot.
//!
//! Three flat tables keyed by ID (lab bridges, networks, endpoints) plus the
//! per-lab management networks. Cross-references are by foreign ID only; the
//! persisted JSON is a direct projection of the tables.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATE_FILE_NAME: &str = "docker_ovs_plugin_state.json";
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Per-lab bookkeeping on the shared bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabBridge {
    pub lab_id: String,
    /// Always the shared agent-wide bridge.
    pub bridge_name: String,
    /// Docker network IDs owned by this lab.
    #[serde(default)]
    pub network_ids: HashSet<String>,
    /// VNI -> OVS port name.
    #[serde(default)]
    pub vxlan_tunnels: HashMap<u32, String>,
    /// External physical interface -> VLAN tag.
    #[serde(default)]
    pub external_ports: HashMap<String, u16>,
    pub last_activity: DateTime<Utc>,
}

impl LabBridge {
    pub fn new(lab_id: &str, bridge_name: &str) -> Self {
        Self {
            lab_id: lab_id.to_string(),
            bridge_name: bridge_name.to_string(),
            network_ids: HashSet::new(),
            vxlan_tunnels: HashMap::new(),
            external_ports: HashMap::new(),
            last_activity: Utc::now(),
        }
    }
}

/// One Docker network == one container interface on the shared bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkState {
    pub network_id: String,
    pub lab_id: String,
    pub interface_name: String,
    pub bridge_name: String,
}

/// One veth pair attached to the shared bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointState {
    pub endpoint_id: String,
    pub network_id: String,
    pub interface_name: String,
    /// OVS-side veth name.
    pub host_veth: String,
    /// Name Docker moves into the container namespace.
    pub cont_veth: String,
    pub vlan_tag: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
}

/// Per-lab Docker bridge network used for eth0 management attachments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementNetwork {
    pub lab_id: String,
    pub network_id: String,
    pub network_name: String,
    pub subnet: String,
    pub gateway: String,
}

/// The whole persisted snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub next_mgmt_subnet_index: u32,
    pub global_next_vlan: u16,
    #[serde(default)]
    pub lab_bridges: HashMap<String, LabBridge>,
    #[serde(default)]
    pub networks: HashMap<String, NetworkState>,
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointState>,
    #[serde(default)]
    pub management_networks: HashMap<String, ManagementNetwork>,
}

/// In-memory tables. Guarded by the plugin's single mutex.
#[derive(Debug, Default)]
pub struct PluginTables {
    pub lab_bridges: HashMap<String, LabBridge>,
    pub networks: HashMap<String, NetworkState>,
    pub endpoints: HashMap<String, EndpointState>,
    pub management_networks: HashMap<String, ManagementNetwork>,
    pub next_mgmt_subnet_index: u32,
}

impl PluginTables {
    pub fn touch_lab(&mut self, lab_id: &str) {
        if let Some(bridge) = self.lab_bridges.get_mut(lab_id) {
            bridge.last_activity = Utc::now();
        }
    }

    pub fn find_endpoint(&self, container: &str, interface: &str) -> Option<&EndpointState> {
        self.endpoints.values().find(|ep| {
            ep.container_name.as_deref() == Some(container) && ep.interface_name == interface
        })
    }

    pub fn endpoint_lab(&self, endpoint: &EndpointState) -> Option<&str> {
        self.networks
            .get(&endpoint.network_id)
            .map(|net| net.lab_id.as_str())
    }

    /// Host-side veths of every tracked endpoint.
    pub fn active_host_veths(&self) -> HashSet<String> {
        self.endpoints
            .values()
            .map(|ep| ep.host_veth.clone())
            .collect()
    }

    pub fn to_persisted(&self, global_next_vlan: u16) -> PersistedState {
        PersistedState {
            version: STATE_SCHEMA_VERSION,
            saved_at: Utc::now(),
            next_mgmt_subnet_index: self.next_mgmt_subnet_index,
            global_next_vlan,
            lab_bridges: self.lab_bridges.clone(),
            networks: self.networks.clone(),
            endpoints: self.endpoints.clone(),
            management_networks: self.management_networks.clone(),
        }
    }

    pub fn load_persisted(&mut self, state: PersistedState) {
        self.next_mgmt_subnet_index = state.next_mgmt_subnet_index.max(1);
        self.lab_bridges = state.lab_bridges;
        self.networks = state.networks;
        self.endpoints = state.endpoints;
        self.management_networks = state.management_networks;
    }
}

pub fn state_file_path(workspace: &Path) -> PathBuf {
    workspace.join(STATE_FILE_NAME)
}

/// Write the snapshot atomically: temp file in the same directory, then
/// rename. Readers observe either the previous or the new state.
pub fn save_snapshot(path: &Path, state: &PersistedState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    let body = serde_json::to_vec_pretty(state)?;
    std::fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename snapshot into {}", path.display()))?;
    Ok(())
}

/// Load the snapshot. A missing file is `Ok(None)`; a corrupt file is an
/// error the caller logs before starting empty.
pub fn load_snapshot(path: &Path) -> Result<Option<PersistedState>> {
    let body = match std::fs::read(path) {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };
    let state: PersistedState =
        serde_json::from_slice(&body).with_context(|| format!("corrupt snapshot {}", path.display()))?;
    if state.version != STATE_SCHEMA_VERSION {
        tracing::warn!(version = state.version, "unknown state file version, attempting load anyway");
    }
    Ok(Some(state))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> PersistedState {
        let mut tables = PluginTables {
            next_mgmt_subnet_index: 3,
            ..Default::default()
        };
        let mut bridge = LabBridge::new("lab1", "arch-ovs");
        bridge.network_ids.insert("net-1".into());
        bridge.vxlan_tunnels.insert(100001, "vx100001".into());
        bridge.external_ports.insert("eno2".into(), 150);
        tables.lab_bridges.insert("lab1".into(), bridge);
        tables.networks.insert(
            "net-1".into(),
            NetworkState {
                network_id: "net-1".into(),
                lab_id: "lab1".into(),
                interface_name: "eth1".into(),
                bridge_name: "arch-ovs".into(),
            },
        );
        tables.endpoints.insert(
            "ep-1".into(),
            EndpointState {
                endpoint_id: "ep-1".into(),
                network_id: "net-1".into(),
                interface_name: "eth1".into(),
                host_veth: "vhep1aa12bc".into(),
                cont_veth: "vcep1aa12bc".into(),
                vlan_tag: 101,
                container_name: Some("archetype-lab1-r1".into()),
            },
        );
        tables.management_networks.insert(
            "lab1".into(),
            ManagementNetwork {
                lab_id: "lab1".into(),
                network_id: "mgmt-1".into(),
                network_name: "archetype-mgmt-lab1".into(),
                subnet: "172.30.1.0/24".into(),
                gateway: "172.30.1.1".into(),
            },
        );
        tables.to_persisted(102)
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        let state = sample_state();
        save_snapshot(&path, &state).unwrap();

        let loaded = load_snapshot(&path).unwrap().expect("snapshot present");
        assert_eq!(loaded.global_next_vlan, 102);
        assert_eq!(loaded.next_mgmt_subnet_index, 3);
        assert_eq!(loaded.lab_bridges.len(), 1);
        assert_eq!(loaded.endpoints["ep-1"].host_veth, "vhep1aa12bc");
        assert_eq!(loaded.lab_bridges["lab1"].vxlan_tunnels[&100001], "vx100001");
        assert_eq!(loaded.management_networks["lab1"].gateway, "172.30.1.1");
    }

    #[test]
    fn missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        assert!(load_snapshot(&path).unwrap().is_none());
    }

    #[test]
    fn corrupt_snapshot_is_error_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        std::fs::write(&path, b"{not json").unwrap();
        assert!(load_snapshot(&path).is_err());
    }

    #[test]
    fn find_endpoint_matches_container_and_interface() {
        let mut tables = PluginTables::default();
        tables.load_persisted(sample_state());
        assert!(tables.find_endpoint("archetype-lab1-r1", "eth1").is_some());
        assert!(tables.find_endpoint("archetype-lab1-r1", "eth2").is_none());
        assert!(tables.find_endpoint("other", "eth1").is_none());
    }
}
