//! Agent settings, loaded once from `ARCHETYPE_AGENT_*` environment variables.

use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Agent identity. Generated when not pinned via env.
    pub agent_id: String,
    pub agent_name: String,
    pub agent_host: String,
    pub agent_port: u16,

    /// Controller connection.
    pub controller_url: String,
    /// Bearer secret for agent endpoints and controller registration.
    /// Empty string disables auth entirely.
    pub controller_secret: String,
    pub heartbeat_interval_secs: u64,

    /// Provider toggles.
    pub enable_docker: bool,
    pub enable_libvirt: bool,

    /// Overlay networking.
    pub enable_vxlan: bool,
    pub local_ip: String,
    pub vxlan_dst_port: u16,

    pub enable_ovs_plugin: bool,
    pub ovs_bridge_name: String,

    pub docker_socket: String,
    pub workspace_path: String,

    pub libvirt_uri: String,
    pub qcow2_store_path: String,
    /// Container-visible image prefix translated to this host path.
    pub host_image_path: String,

    /// Timeouts (seconds).
    pub registration_timeout_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub container_stop_timeout_secs: u64,
    pub extraction_timeout_secs: u64,
    pub console_lock_timeout_secs: u64,

    /// Lab bridges idle longer than this get cleaned up.
    pub lab_bridge_ttl_secs: u64,

    /// MTU for plugin-created veth pairs.
    pub veth_mtu: u32,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(format!("ARCHETYPE_AGENT_{key}")).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(format!("ARCHETYPE_AGENT_{key}"))
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(format!("ARCHETYPE_AGENT_{key}")) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let agent_id = {
            let configured = env_or("AGENT_ID", "");
            if configured.is_empty() {
                uuid::Uuid::new_v4().to_string()
            } else {
                configured
            }
        };
        Self {
            agent_id,
            agent_name: env_or("AGENT_NAME", "default"),
            agent_host: env_or("AGENT_HOST", "0.0.0.0"),
            agent_port: env_parse("AGENT_PORT", 8001),
            controller_url: env_or("CONTROLLER_URL", "http://localhost:8000"),
            controller_secret: env_or("CONTROLLER_SECRET", ""),
            heartbeat_interval_secs: env_parse("HEARTBEAT_INTERVAL", 10),
            enable_docker: env_bool("ENABLE_DOCKER", true),
            enable_libvirt: env_bool("ENABLE_LIBVIRT", false),
            enable_vxlan: env_bool("ENABLE_VXLAN", true),
            local_ip: env_or("LOCAL_IP", ""),
            vxlan_dst_port: env_parse("VXLAN_DST_PORT", 4789),
            enable_ovs_plugin: env_bool("ENABLE_OVS_PLUGIN", true),
            ovs_bridge_name: env_or("OVS_BRIDGE_NAME", "arch-ovs"),
            docker_socket: env_or("DOCKER_SOCKET", "unix:///var/run/docker.sock"),
            workspace_path: env_or("WORKSPACE_PATH", "/var/lib/archetype-agent"),
            libvirt_uri: env_or("LIBVIRT_URI", "qemu:///system"),
            qcow2_store_path: env_or("QCOW2_STORE_PATH", "/var/lib/archetype/qcow2"),
            host_image_path: std::env::var("ARCHETYPE_HOST_IMAGE_PATH").unwrap_or_default(),
            registration_timeout_secs: env_parse("REGISTRATION_TIMEOUT", 10),
            heartbeat_timeout_secs: env_parse("HEARTBEAT_TIMEOUT", 5),
            container_stop_timeout_secs: env_parse("CONTAINER_STOP_TIMEOUT", 10),
            extraction_timeout_secs: env_parse("EXTRACTION_TIMEOUT", 120),
            console_lock_timeout_secs: env_parse("CONSOLE_LOCK_TIMEOUT", 60),
            lab_bridge_ttl_secs: env_parse("LAB_BRIDGE_TTL", 24 * 3600),
            veth_mtu: env_parse("VETH_MTU", 9214),
        }
    }
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

pub fn settings() -> &'static Settings {
    SETTINGS.get_or_init(Settings::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let s = Settings::from_env();
        assert_eq!(s.ovs_bridge_name, "arch-ovs");
        assert_eq!(s.vxlan_dst_port, 4789);
        assert!(!s.agent_id.is_empty());
    }
}
