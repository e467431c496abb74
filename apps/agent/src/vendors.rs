//! Vendor device catalog: a pure lookup table keyed by device kind.
//!
//! Everything device-specific lives here — readiness probes, console
//! credentials and prompts, config extraction method, VM platform knobs —
//! so the providers stay vendor-agnostic.

/// How to decide a device finished booting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    None,
    LogPattern,
    CliProbe,
    Ssh,
}

/// How to pull the running config off a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMethod {
    /// exec_run inside the container (bash-wrapped for pipes).
    Docker,
    /// sshpass ssh into the container's management IP.
    Ssh,
    /// Serial console via virsh, driven by the extractor state machine.
    Serial,
    /// No extraction support.
    None,
}

#[derive(Debug, Clone)]
pub struct VendorConfig {
    pub kind: &'static str,
    pub display_name: &'static str,

    pub probe: ProbeKind,
    pub readiness_pattern: &'static str,
    /// (pattern, progress percent) pairs reported while booting.
    pub progress_patterns: &'static [(&'static str, u8)],
    pub readiness_timeout_secs: u64,
    /// SSH probes tolerate auth failures this long after boot start before
    /// falling back to the serial console probe.
    pub ssh_auth_grace_secs: u64,

    pub username: &'static str,
    pub password: &'static str,
    pub enable_password: &'static str,
    pub prompt_pattern: &'static str,
    pub paging_disable: &'static str,
    pub config_command: &'static str,

    pub extract_method: ExtractMethod,
    /// Command for Docker/Ssh extraction.
    pub extract_command: &'static str,

    /// VM platform knobs (ignored for container kinds).
    pub efi_boot: bool,
    /// Stateless EFI: pflash passthrough without a loader element.
    pub efi_stateless: bool,
    pub needs_mgmt_nic: bool,
    pub poap_enabled: bool,
    pub data_volume_gb: u32,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub nic_model: &'static str,
    pub disk_bus: &'static str,
    pub machine_type: &'static str,
    /// Percent cap applied via cputune, 0 = uncapped.
    pub cpu_limit: u32,

    /// Commands run once after the device reports ready.
    pub post_boot_commands: &'static [&'static str],
}

const CISCO_MODE_PROMPT: &str = r"[\w.\-]+(?:\([^)\r\n]+\))?[>#]\s*$";

const CEOS: VendorConfig = VendorConfig {
    kind: "ceos",
    display_name: "Arista cEOS",
    probe: ProbeKind::LogPattern,
    readiness_pattern: r"SuperServer is ready|Startup complete",
    progress_patterns: &[
        (r"ZeroTouch", 20),
        (r"AAA", 40),
        (r"Starting (ProcMgr|EOS API)", 60),
        (r"localhost-", 80),
    ],
    readiness_timeout_secs: 300,
    ssh_auth_grace_secs: 0,
    username: "admin",
    password: "",
    enable_password: "",
    prompt_pattern: CISCO_MODE_PROMPT,
    paging_disable: "terminal length 0",
    config_command: "show running-config",
    extract_method: ExtractMethod::Docker,
    extract_command: "Cli -p 15 -c 'show running-config'",
    efi_boot: false,
    efi_stateless: false,
    needs_mgmt_nic: false,
    poap_enabled: false,
    data_volume_gb: 0,
    vcpus: 0,
    memory_mb: 0,
    nic_model: "virtio",
    disk_bus: "virtio",
    machine_type: "pc",
    cpu_limit: 0,
    post_boot_commands: &[
        "Cli -p 15 -c 'configure session archboot\nno aaa root\nwrite memory\ncommit'",
    ],
};

const CISCO_N9KV: VendorConfig = VendorConfig {
    kind: "cisco_n9kv",
    display_name: "Cisco Nexus 9000v",
    probe: ProbeKind::Ssh,
    readiness_pattern: "",
    progress_patterns: &[],
    readiness_timeout_secs: 1200,
    ssh_auth_grace_secs: 180,
    username: "admin",
    password: "Archetype123!",
    enable_password: "",
    prompt_pattern: CISCO_MODE_PROMPT,
    paging_disable: "terminal length 0",
    config_command: "show running-config",
    extract_method: ExtractMethod::Serial,
    extract_command: "",
    efi_boot: true,
    efi_stateless: false,
    needs_mgmt_nic: true,
    poap_enabled: true,
    data_volume_gb: 0,
    vcpus: 4,
    memory_mb: 10240,
    nic_model: "e1000",
    disk_bus: "sata",
    machine_type: "q35",
    cpu_limit: 0,
    post_boot_commands: &["copy running-config startup-config"],
};

const CISCO_CAT9KV: VendorConfig = VendorConfig {
    kind: "cisco_cat9kv",
    display_name: "Cisco Catalyst 9000v",
    probe: ProbeKind::Ssh,
    readiness_pattern: "",
    progress_patterns: &[],
    readiness_timeout_secs: 2400,
    ssh_auth_grace_secs: 300,
    username: "admin",
    password: "Archetype123!",
    enable_password: "",
    prompt_pattern: CISCO_MODE_PROMPT,
    paging_disable: "terminal length 0",
    config_command: "show running-config",
    extract_method: ExtractMethod::Serial,
    extract_command: "",
    efi_boot: true,
    efi_stateless: true,
    needs_mgmt_nic: false,
    poap_enabled: false,
    data_volume_gb: 4,
    vcpus: 4,
    memory_mb: 18432,
    nic_model: "e1000",
    disk_bus: "ide",
    machine_type: "q35",
    cpu_limit: 50,
    post_boot_commands: &["write memory"],
};

const CISCO_IOL: VendorConfig = VendorConfig {
    kind: "cisco_iol",
    display_name: "Cisco IOL",
    probe: ProbeKind::LogPattern,
    readiness_pattern: r"Press RETURN to get started|%SYS-5-RESTART",
    progress_patterns: &[],
    readiness_timeout_secs: 300,
    ssh_auth_grace_secs: 0,
    username: "admin",
    password: "admin",
    enable_password: "",
    prompt_pattern: CISCO_MODE_PROMPT,
    paging_disable: "terminal length 0",
    config_command: "show running-config",
    extract_method: ExtractMethod::None,
    extract_command: "",
    efi_boot: false,
    efi_stateless: false,
    needs_mgmt_nic: false,
    poap_enabled: false,
    data_volume_gb: 0,
    vcpus: 0,
    memory_mb: 0,
    nic_model: "virtio",
    disk_bus: "virtio",
    machine_type: "pc",
    cpu_limit: 0,
    post_boot_commands: &[],
};

const CJUNOS: VendorConfig = VendorConfig {
    kind: "cjunos",
    display_name: "Juniper cJunosEvolved",
    probe: ProbeKind::CliProbe,
    readiness_pattern: "",
    progress_patterns: &[],
    readiness_timeout_secs: 600,
    ssh_auth_grace_secs: 0,
    username: "root",
    password: "root123",
    enable_password: "",
    prompt_pattern: r"[\w.\-@]+[>#%]\s*$",
    paging_disable: "set cli screen-length 0",
    config_command: "show configuration",
    extract_method: ExtractMethod::Ssh,
    extract_command: "cli -c 'show configuration | display set'",
    efi_boot: false,
    efi_stateless: false,
    needs_mgmt_nic: false,
    poap_enabled: false,
    data_volume_gb: 0,
    vcpus: 0,
    memory_mb: 0,
    nic_model: "virtio",
    disk_bus: "virtio",
    machine_type: "pc",
    cpu_limit: 0,
    post_boot_commands: &[],
};

const LINUX: VendorConfig = VendorConfig {
    kind: "linux",
    display_name: "Linux",
    probe: ProbeKind::None,
    readiness_pattern: "",
    progress_patterns: &[],
    readiness_timeout_secs: 60,
    ssh_auth_grace_secs: 0,
    username: "root",
    password: "",
    enable_password: "",
    prompt_pattern: r"[#$]\s*$",
    paging_disable: "",
    config_command: "",
    extract_method: ExtractMethod::None,
    extract_command: "",
    efi_boot: false,
    efi_stateless: false,
    needs_mgmt_nic: false,
    poap_enabled: false,
    data_volume_gb: 0,
    vcpus: 1,
    memory_mb: 1024,
    nic_model: "virtio",
    disk_bus: "virtio",
    machine_type: "pc",
    cpu_limit: 0,
    post_boot_commands: &[],
};

/// Look up a vendor config. Unknown kinds get the generic linux profile.
pub fn vendor_config(kind: &str) -> &'static VendorConfig {
    match kind {
        "ceos" => &CEOS,
        "cisco_n9kv" => &CISCO_N9KV,
        "cisco_cat9kv" => &CISCO_CAT9KV,
        "cisco_iol" => &CISCO_IOL,
        "cjunos" => &CJUNOS,
        _ => &LINUX,
    }
}

pub fn is_ceos_kind(kind: &str) -> bool {
    kind == "ceos" || kind.starts_with("ceos")
}

/// CLI probe command for CliProbe vendors.
pub fn cli_probe_command(kind: &str) -> Option<(&'static str, &'static str)> {
    match kind {
        "cjunos" => Some(("cli -c 'show system uptime'", "Current time")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_kind_falls_back_to_linux() {
        assert_eq!(vendor_config("mystery_box").kind, "linux");
    }

    #[test]
    fn n9kv_requires_mgmt_nic_and_poap() {
        let cfg = vendor_config("cisco_n9kv");
        assert!(cfg.needs_mgmt_nic);
        assert!(cfg.poap_enabled);
        assert!(cfg.efi_boot);
        assert_eq!(cfg.readiness_timeout_secs, 1200);
    }

    #[test]
    fn readiness_timeouts_follow_boot_cost() {
        assert!(
            vendor_config("cisco_cat9kv").readiness_timeout_secs
                > vendor_config("cisco_n9kv").readiness_timeout_secs
        );
        assert!(
            vendor_config("cisco_n9kv").readiness_timeout_secs
                > vendor_config("ceos").readiness_timeout_secs
        );
    }

    #[test]
    fn ceos_extracts_via_docker_exec() {
        let cfg = vendor_config("ceos");
        assert_eq!(cfg.extract_method, ExtractMethod::Docker);
        assert!(cfg.extract_command.contains("show running-config"));
    }
}
