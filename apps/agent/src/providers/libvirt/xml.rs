//! Libvirt domain XML generation.
//!
//! Deterministic string assembly with explicit escaping. Machine types, disk
//! buses, NIC models and the libvirt driver are validated against closed
//! lists; anything else is rejected before XML is built.

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

pub const ALLOWED_MACHINE_TYPES: &[&str] = &["pc", "q35", "pc-q35-6.2", "pc-i440fx-6.2"];
pub const ALLOWED_DISK_BUSES: &[&str] = &["virtio", "ide", "sata", "scsi"];
pub const ALLOWED_NIC_MODELS: &[&str] = &["virtio", "e1000", "e1000e", "rtl8139", "vmxnet3"];
pub const ALLOWED_DRIVERS: &[&str] = &["kvm", "qemu"];

pub fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Deterministic MAC for (domain, interface index): bytes 4..6 of the
/// name+index hash behind the libvirt-reserved 52:54:00 OUI. Stable across
/// redeploys so DHCP reservations survive.
pub fn deterministic_mac(domain_name: &str, interface_index: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(domain_name.as_bytes());
    hasher.update(interface_index.to_be_bytes());
    let digest = hasher.finalize();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", digest[0], digest[1], digest[2])
}

#[derive(Debug, Clone)]
pub struct DiskSpec {
    pub path: String,
    pub bus: String,
    /// hda, hdb, vda ... assigned by caller.
    pub target_dev: String,
}

#[derive(Debug, Clone)]
pub enum NicAttachment {
    /// Data-plane NIC on the shared OVS bridge with an inline VLAN tag.
    OvsBridge { bridge: String, vlan_tag: u16 },
    /// Management NIC on a libvirt network (POAP network or `default`).
    Network { network: String },
}

#[derive(Debug, Clone)]
pub struct NicSpec {
    pub model: String,
    pub attachment: NicAttachment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EfiMode {
    None,
    /// Firmware element with an NVRAM template (stateful).
    Stateful,
    /// qemu:commandline pflash passthrough, read-only, no loader element.
    Stateless,
}

#[derive(Debug, Clone)]
pub struct DomainSpec {
    pub name: String,
    pub driver: String,
    pub machine: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub disks: Vec<DiskSpec>,
    pub nics: Vec<NicSpec>,
    pub efi: EfiMode,
    pub ovmf_code_path: Option<String>,
    pub ovmf_vars_template: Option<String>,
    /// Percent of total CPU, 1-100. 0 disables the cap.
    pub cpu_limit: u32,
    /// archetype metadata preserved across restarts.
    pub device_kind: String,
    pub probe_kind: String,
    pub probe_pattern: String,
    pub probe_timeout_secs: u64,
}

fn validate(spec: &DomainSpec) -> Result<()> {
    if !ALLOWED_DRIVERS.contains(&spec.driver.as_str()) {
        bail!("libvirt driver '{}' not allowed", spec.driver);
    }
    if !ALLOWED_MACHINE_TYPES.contains(&spec.machine.as_str()) {
        bail!("machine type '{}' not allowed", spec.machine);
    }
    for disk in &spec.disks {
        if !ALLOWED_DISK_BUSES.contains(&disk.bus.as_str()) {
            bail!("disk bus '{}' not allowed", disk.bus);
        }
    }
    for nic in &spec.nics {
        if !ALLOWED_NIC_MODELS.contains(&nic.model.as_str()) {
            bail!("nic model '{}' not allowed", nic.model);
        }
    }
    if spec.cpu_limit > 100 {
        bail!("cpu_limit {} out of range 1-100", spec.cpu_limit);
    }
    if spec.efi != EfiMode::None && spec.ovmf_code_path.is_none() {
        bail!("EFI requested but no OVMF firmware found on host");
    }
    Ok(())
}

pub fn generate_domain_xml(spec: &DomainSpec) -> Result<String> {
    validate(spec)?;

    let name = xml_escape(&spec.name);
    let memory_kib = spec.memory_mb * 1024;
    let mut xml = String::new();

    xml.push_str(&format!(
        "<domain type='{}' xmlns:qemu='http://libvirt.org/schemas/domain/qemu/1.0'>\n",
        spec.driver
    ));
    xml.push_str(&format!("  <name>{name}</name>\n"));

    // Metadata survives define/undefine cycles; the agent reads it back to
    // rebuild probe configuration after a restart.
    xml.push_str("  <metadata>\n");
    xml.push_str("    <archetype:device xmlns:archetype='https://archetype.dev/xmlns/device/1.0'>\n");
    xml.push_str(&format!(
        "      <archetype:kind>{}</archetype:kind>\n",
        xml_escape(&spec.device_kind)
    ));
    xml.push_str(&format!(
        "      <archetype:probe type='{}' timeout='{}'>{}</archetype:probe>\n",
        xml_escape(&spec.probe_kind),
        spec.probe_timeout_secs,
        xml_escape(&spec.probe_pattern)
    ));
    xml.push_str("    </archetype:device>\n");
    xml.push_str("  </metadata>\n");

    xml.push_str(&format!("  <memory unit='KiB'>{memory_kib}</memory>\n"));
    xml.push_str(&format!("  <vcpu placement='static'>{}</vcpu>\n", spec.vcpus));

    if spec.cpu_limit > 0 {
        let quota = spec.vcpus as u64 * 100_000 * spec.cpu_limit as u64 / 100;
        xml.push_str("  <cputune>\n");
        xml.push_str("    <period>100000</period>\n");
        xml.push_str(&format!("    <quota>{quota}</quota>\n"));
        xml.push_str("  </cputune>\n");
    }

    xml.push_str("  <os");
    if spec.efi == EfiMode::Stateful {
        xml.push_str(" firmware='efi'");
    }
    xml.push_str(">\n");
    xml.push_str(&format!(
        "    <type arch='x86_64' machine='{}'>hvm</type>\n",
        spec.machine
    ));
    if spec.efi == EfiMode::Stateful {
        let code = xml_escape(spec.ovmf_code_path.as_deref().unwrap_or_default());
        xml.push_str(&format!(
            "    <loader readonly='yes' type='pflash'>{code}</loader>\n"
        ));
        if let Some(vars) = &spec.ovmf_vars_template {
            xml.push_str(&format!(
                "    <nvram template='{}'/>\n",
                xml_escape(vars)
            ));
        }
    }
    xml.push_str("    <boot dev='hd'/>\n");
    xml.push_str("  </os>\n");

    xml.push_str("  <features><acpi/><apic/></features>\n");
    xml.push_str("  <cpu mode='host-passthrough'/>\n");
    xml.push_str("  <on_poweroff>destroy</on_poweroff>\n");
    xml.push_str("  <on_reboot>restart</on_reboot>\n");
    xml.push_str("  <on_crash>destroy</on_crash>\n");

    xml.push_str("  <devices>\n");

    for disk in &spec.disks {
        xml.push_str("    <disk type='file' device='disk'>\n");
        xml.push_str("      <driver name='qemu' type='qcow2'/>\n");
        xml.push_str(&format!(
            "      <source file='{}'/>\n",
            xml_escape(&disk.path)
        ));
        xml.push_str(&format!(
            "      <target dev='{}' bus='{}'/>\n",
            xml_escape(&disk.target_dev),
            disk.bus
        ));
        xml.push_str("    </disk>\n");
    }

    for (index, nic) in spec.nics.iter().enumerate() {
        let mac = deterministic_mac(&spec.name, index as u32);
        match &nic.attachment {
            NicAttachment::OvsBridge { bridge, vlan_tag } => {
                xml.push_str("    <interface type='bridge'>\n");
                xml.push_str(&format!("      <mac address='{mac}'/>\n"));
                xml.push_str(&format!(
                    "      <source bridge='{}'/>\n",
                    xml_escape(bridge)
                ));
                xml.push_str("      <virtualport type='openvswitch'/>\n");
                xml.push_str(&format!(
                    "      <vlan><tag id='{vlan_tag}'/></vlan>\n"
                ));
                xml.push_str(&format!("      <model type='{}'/>\n", nic.model));
                xml.push_str("    </interface>\n");
            }
            NicAttachment::Network { network } => {
                xml.push_str("    <interface type='network'>\n");
                xml.push_str(&format!("      <mac address='{mac}'/>\n"));
                xml.push_str(&format!(
                    "      <source network='{}'/>\n",
                    xml_escape(network)
                ));
                xml.push_str(&format!("      <model type='{}'/>\n", nic.model));
                xml.push_str("    </interface>\n");
            }
        }
    }

    xml.push_str("    <serial type='pty'><target port='0'/></serial>\n");
    xml.push_str("    <console type='pty'><target type='serial' port='0'/></console>\n");
    xml.push_str("  </devices>\n");

    if spec.efi == EfiMode::Stateless {
        let code = xml_escape(spec.ovmf_code_path.as_deref().unwrap_or_default());
        xml.push_str("  <qemu:commandline>\n");
        xml.push_str("    <qemu:arg value='-drive'/>\n");
        xml.push_str(&format!(
            "    <qemu:arg value='if=pflash,format=raw,readonly=on,file={code}'/>\n"
        ));
        xml.push_str("  </qemu:commandline>\n");
    }

    xml.push_str("</domain>\n");
    Ok(xml)
}

/// Probe well-known OVMF install locations on the host.
pub fn detect_ovmf_paths() -> (Option<String>, Option<String>) {
    const CODE_CANDIDATES: &[&str] = &[
        "/usr/share/OVMF/OVMF_CODE.fd",
        "/usr/share/OVMF/OVMF_CODE_4M.fd",
        "/usr/share/edk2/x64/OVMF_CODE.4m.fd",
        "/usr/share/edk2/ovmf/OVMF_CODE.fd",
    ];
    const VARS_CANDIDATES: &[&str] = &[
        "/usr/share/OVMF/OVMF_VARS.fd",
        "/usr/share/OVMF/OVMF_VARS_4M.fd",
        "/usr/share/edk2/x64/OVMF_VARS.4m.fd",
        "/usr/share/edk2/ovmf/OVMF_VARS.fd",
    ];
    let code = CODE_CANDIDATES
        .iter()
        .find(|p| std::path::Path::new(p).exists())
        .map(|p| p.to_string());
    let vars = VARS_CANDIDATES
        .iter()
        .find(|p| std::path::Path::new(p).exists())
        .map(|p| p.to_string());
    (code, vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> DomainSpec {
        DomainSpec {
            name: "arch-lab1-r1".into(),
            driver: "kvm".into(),
            machine: "q35".into(),
            vcpus: 4,
            memory_mb: 8192,
            disks: vec![DiskSpec {
                path: "/var/lib/archetype-agent/lab1/disks/r1.qcow2".into(),
                bus: "sata".into(),
                target_dev: "sda".into(),
            }],
            nics: vec![NicSpec {
                model: "e1000".into(),
                attachment: NicAttachment::OvsBridge {
                    bridge: "arch-ovs".into(),
                    vlan_tag: 150,
                },
            }],
            efi: EfiMode::None,
            ovmf_code_path: None,
            ovmf_vars_template: None,
            cpu_limit: 0,
            device_kind: "cisco_n9kv".into(),
            probe_kind: "ssh".into(),
            probe_pattern: "".into(),
            probe_timeout_secs: 1200,
        }
    }

    #[test]
    fn deterministic_mac_is_stable_and_prefixed() {
        let mac1 = deterministic_mac("arch-lab1-r1", 0);
        let mac2 = deterministic_mac("arch-lab1-r1", 0);
        let mac3 = deterministic_mac("arch-lab1-r1", 1);
        assert_eq!(mac1, mac2);
        assert_ne!(mac1, mac3);
        assert!(mac1.starts_with("52:54:00:"));
        assert_eq!(mac1.len(), 17);
    }

    #[test]
    fn ovs_nic_carries_virtualport_and_vlan() {
        let xml = generate_domain_xml(&base_spec()).unwrap();
        assert!(xml.contains("<virtualport type='openvswitch'/>"));
        assert!(xml.contains("<vlan><tag id='150'/></vlan>"));
        assert!(xml.contains("<source bridge='arch-ovs'/>"));
    }

    #[test]
    fn invalid_whitelist_values_fail() {
        let mut spec = base_spec();
        spec.machine = "pc-weird".into();
        assert!(generate_domain_xml(&spec).is_err());

        let mut spec = base_spec();
        spec.disks[0].bus = "floppy".into();
        assert!(generate_domain_xml(&spec).is_err());

        let mut spec = base_spec();
        spec.nics[0].model = "ne2k".into();
        assert!(generate_domain_xml(&spec).is_err());

        let mut spec = base_spec();
        spec.driver = "xen".into();
        assert!(generate_domain_xml(&spec).is_err());
    }

    #[test]
    fn identifiers_are_escaped() {
        let mut spec = base_spec();
        spec.disks[0].path = "/tmp/evil'<>&.qcow2".into();
        let xml = generate_domain_xml(&spec).unwrap();
        assert!(!xml.contains("evil'<>"));
        assert!(xml.contains("evil&apos;&lt;&gt;&amp;.qcow2"));
    }

    #[test]
    fn cputune_quota_scales_with_vcpus_and_pct() {
        let mut spec = base_spec();
        spec.cpu_limit = 50;
        let xml = generate_domain_xml(&spec).unwrap();
        // 4 vcpus * 100000 * 50% = 200000
        assert!(xml.contains("<period>100000</period>"));
        assert!(xml.contains("<quota>200000</quota>"));
    }

    #[test]
    fn cputune_absent_when_uncapped() {
        let xml = generate_domain_xml(&base_spec()).unwrap();
        assert!(!xml.contains("<cputune>"));
    }

    #[test]
    fn stateful_efi_uses_loader_and_nvram() {
        let mut spec = base_spec();
        spec.efi = EfiMode::Stateful;
        spec.ovmf_code_path = Some("/usr/share/OVMF/OVMF_CODE.fd".into());
        spec.ovmf_vars_template = Some("/usr/share/OVMF/OVMF_VARS.fd".into());
        let xml = generate_domain_xml(&spec).unwrap();
        assert!(xml.contains("firmware='efi'"));
        assert!(xml.contains("<loader readonly='yes' type='pflash'>"));
        assert!(xml.contains("<nvram template='/usr/share/OVMF/OVMF_VARS.fd'/>"));
        assert!(!xml.contains("qemu:commandline"));
    }

    #[test]
    fn stateless_efi_uses_pflash_passthrough_without_loader() {
        let mut spec = base_spec();
        spec.efi = EfiMode::Stateless;
        spec.ovmf_code_path = Some("/usr/share/OVMF/OVMF_CODE.fd".into());
        let xml = generate_domain_xml(&spec).unwrap();
        assert!(!xml.contains("<loader"));
        assert!(xml.contains("qemu:commandline"));
        assert!(xml.contains("if=pflash,format=raw,readonly=on,file=/usr/share/OVMF/OVMF_CODE.fd"));
    }

    #[test]
    fn efi_without_firmware_is_rejected() {
        let mut spec = base_spec();
        spec.efi = EfiMode::Stateful;
        spec.ovmf_code_path = None;
        assert!(generate_domain_xml(&spec).is_err());
    }

    #[test]
    fn metadata_preserves_probe_config() {
        let xml = generate_domain_xml(&base_spec()).unwrap();
        assert!(xml.contains("<archetype:kind>cisco_n9kv</archetype:kind>"));
        assert!(xml.contains("<archetype:probe type='ssh' timeout='1200'>"));
    }

    #[test]
    fn mgmt_nic_is_network_type() {
        let mut spec = base_spec();
        spec.nics.insert(
            0,
            NicSpec {
                model: "e1000".into(),
                attachment: NicAttachment::Network {
                    network: "ap-poap-lab1-r1".into(),
                },
            },
        );
        let xml = generate_domain_xml(&spec).unwrap();
        assert!(xml.contains("<interface type='network'>"));
        assert!(xml.contains("<source network='ap-poap-lab1-r1'/>"));
    }
}
