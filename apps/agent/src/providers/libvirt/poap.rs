//! POAP bootstrap for Nexus 9000v.
//!
//! A fresh N9Kv broadcasts DHCP on its management NIC and follows options
//! 66/67 to fetch a bootstrap script. We give each POAP-enabled node a
//! dedicated libvirt NAT network whose dnsmasq pushes next-server and a
//! bootfile URL pointing back at this agent, plus the two HTTP endpoints
//! that serve the script and the startup config.

use crate::providers::libvirt::xml::xml_escape;

pub fn poap_network_name(lab_id: &str, node_name: &str) -> String {
    let lab: String = lab_id.chars().take(12).collect();
    let node: String = node_name.chars().take(20).collect();
    format!("ap-poap-{lab}-{node}")
}

/// Libvirt network XML for one node's POAP NAT network. The gateway address
/// doubles as the TFTP/HTTP next-server (option 66); option 67 carries the
/// full bootstrap URL.
pub fn poap_network_xml(
    lab_id: &str,
    node_name: &str,
    subnet_octet: u8,
    agent_ip: &str,
    agent_port: u16,
) -> String {
    let name = poap_network_name(lab_id, node_name);
    let gateway = format!("192.168.{subnet_octet}.1");
    let dhcp_start = format!("192.168.{subnet_octet}.10");
    let dhcp_end = format!("192.168.{subnet_octet}.100");
    let script_url = format!(
        "http://{agent_ip}:{agent_port}/poap/{lab_id}/{node_name}/script.py"
    );
    format!(
        "<network xmlns:dnsmasq='http://libvirt.org/schemas/network/dnsmasq/1.0'>\n\
         \x20\x20<name>{name}</name>\n\
         \x20\x20<forward mode='nat'/>\n\
         \x20\x20<ip address='{gateway}' netmask='255.255.255.0'>\n\
         \x20\x20\x20\x20<dhcp>\n\
         \x20\x20\x20\x20\x20\x20<range start='{dhcp_start}' end='{dhcp_end}'/>\n\
         \x20\x20\x20\x20</dhcp>\n\
         \x20\x20</ip>\n\
         \x20\x20<dnsmasq:options>\n\
         \x20\x20\x20\x20<dnsmasq:option value='dhcp-option=66,&quot;{gateway}&quot;'/>\n\
         \x20\x20\x20\x20<dnsmasq:option value='dhcp-option=67,&quot;{url}&quot;'/>\n\
         \x20\x20</dnsmasq:options>\n\
         </network>\n",
        name = xml_escape(&name),
        gateway = gateway,
        dhcp_start = dhcp_start,
        dhcp_end = dhcp_end,
        url = xml_escape(&script_url),
    )
}

/// The POAP bootstrap script served to the switch. NX-OS runs this with its
/// bundled python; it downloads the startup config and schedules it to be
/// applied on the next boot.
pub fn poap_script(config_url: &str) -> String {
    format!(
        r#"#!/usr/bin/env python
# POAP bootstrap: download startup config and persist it to bootflash.
import urllib2
import os

CONFIG_URL = "{config_url}"
TARGET = "/bootflash/startup-config"

def download_config():
    resp = urllib2.urlopen(CONFIG_URL, timeout=60)
    data = resp.read()
    if not data.strip():
        raise Exception("empty startup config from %s" % CONFIG_URL)
    with open(TARGET, "w") as fh:
        fh.write(data)

def apply_config():
    import cli
    cli.cli("copy bootflash:startup-config startup-config")

download_config()
apply_config()
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_xml_pushes_options_66_and_67() {
        let xml = poap_network_xml("lab1", "n9k1", 77, "10.0.0.5", 8001);
        assert!(xml.contains("<name>ap-poap-lab1-n9k1</name>"));
        assert!(xml.contains("dhcp-option=66,&quot;192.168.77.1&quot;"));
        assert!(xml.contains(
            "dhcp-option=67,&quot;http://10.0.0.5:8001/poap/lab1/n9k1/script.py&quot;"
        ));
        assert!(xml.contains("<forward mode='nat'/>"));
    }

    #[test]
    fn script_embeds_config_url_and_persists() {
        let script = poap_script("http://10.0.0.5:8001/poap/lab1/n9k1/startup-config");
        assert!(script
            .contains("CONFIG_URL = \"http://10.0.0.5:8001/poap/lab1/n9k1/startup-config\""));
        assert!(script.contains("copy bootflash:startup-config startup-config"));
    }

    #[test]
    fn network_name_truncates_long_ids() {
        let name = poap_network_name("0123456789abcdefgh", "a-very-long-node-name-indeed");
        assert_eq!(name, "ap-poap-0123456789ab-a-very-long-node-nam");
    }
}
