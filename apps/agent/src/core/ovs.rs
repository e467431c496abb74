//! Open vSwitch plumbing. Everything goes through `ovs-vsctl`/`ovs-ofctl`
//! subprocesses; there is no OVSDB linkage.

use anyhow::{bail, Result};
use std::collections::HashSet;

use crate::core::cmd;

/// external_ids marker claiming a port as ours. Reconciliation refuses to
/// delete veth-named ports that do not carry it.
pub const OWNED_EXTERNAL_ID: &str = "archetype-owned";

pub async fn vsctl(args: &[&str]) -> Result<(i32, String, String)> {
    cmd::run("ovs-vsctl", args).await
}

pub async fn vsctl_checked(args: &[&str]) -> Result<String> {
    let (code, stdout, stderr) = vsctl(args).await?;
    if code != 0 {
        bail!("ovs-vsctl {} failed: {}", args.join(" "), stderr.trim());
    }
    Ok(stdout)
}

pub async fn bridge_exists(bridge: &str) -> bool {
    matches!(vsctl(&["br-exists", bridge]).await, Ok((0, _, _)))
}

/// Idempotently create the shared bridge: fail-mode standalone, a
/// `priority=1,actions=normal` default flow, interface up.
pub async fn ensure_bridge(bridge: &str) -> Result<()> {
    vsctl_checked(&["--may-exist", "add-br", bridge]).await?;
    vsctl_checked(&["set-fail-mode", bridge, "standalone"]).await?;
    let (code, _, stderr) = cmd::run("ovs-ofctl", &["add-flow", bridge, "priority=1,actions=normal"]).await?;
    if code != 0 {
        tracing::warn!(bridge, stderr = %stderr.trim(), "could not install default flow");
    }
    cmd::run_checked("ip", &["link", "set", bridge, "up"]).await?;
    Ok(())
}

pub async fn list_ports(bridge: &str) -> Result<Vec<String>> {
    let stdout = vsctl_checked(&["list-ports", bridge]).await?;
    Ok(stdout
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

pub async fn port_exists(bridge: &str, port: &str) -> bool {
    list_ports(bridge)
        .await
        .map(|ports| ports.iter().any(|p| p == port))
        .unwrap_or(false)
}

/// Read a port's VLAN tag. Untagged ports report None.
pub async fn get_port_tag(port: &str) -> Result<Option<u16>> {
    let stdout = vsctl_checked(&["get", "port", port, "tag"]).await?;
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "[]" {
        return Ok(None);
    }
    Ok(trimmed.parse().ok())
}

pub async fn set_port_tag(port: &str, tag: u16) -> Result<()> {
    vsctl_checked(&["set", "port", port, &format!("tag={tag}")]).await?;
    Ok(())
}

/// Collect every VLAN tag currently present on any port of the bridge.
/// The allocator consults this so fresh tags never collide with tags that
/// arrived out-of-band (VXLAN trunks, externally attached interfaces).
pub async fn tags_in_use(bridge: &str) -> Result<HashSet<u16>> {
    let mut tags = HashSet::new();
    for port in list_ports(bridge).await? {
        if let Ok(Some(tag)) = get_port_tag(&port).await {
            tags.insert(tag);
        }
    }
    Ok(tags)
}

/// Attach a port to the bridge with a VLAN tag and our ownership claim.
pub async fn add_port_with_tag(bridge: &str, port: &str, tag: u16) -> Result<()> {
    vsctl_checked(&[
        "--may-exist",
        "add-port",
        bridge,
        port,
        &format!("tag={tag}"),
        "--",
        "set",
        "port",
        port,
        &format!("external_ids:{OWNED_EXTERNAL_ID}=true"),
    ])
    .await?;
    Ok(())
}

pub async fn del_port(bridge: &str, port: &str) -> Result<()> {
    vsctl_checked(&["--if-exists", "del-port", bridge, port]).await?;
    Ok(())
}

/// Whether the port carries our ownership claim.
pub async fn port_is_owned(port: &str) -> bool {
    match vsctl(&[
        "get",
        "port",
        port,
        &format!("external_ids:{OWNED_EXTERNAL_ID}"),
    ])
    .await
    {
        Ok((0, stdout, _)) => stdout.trim().trim_matches('"') == "true",
        _ => false,
    }
}

pub async fn list_bridges() -> Result<Vec<String>> {
    let stdout = vsctl_checked(&["list-br"]).await?;
    Ok(stdout
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

pub async fn delete_bridge(bridge: &str) -> Result<()> {
    vsctl_checked(&["--if-exists", "del-br", bridge]).await?;
    Ok(())
}

/// ovs-vsctl availability probe for health reporting.
pub async fn is_healthy() -> bool {
    matches!(vsctl(&["show"]).await, Ok((0, _, _)))
}
