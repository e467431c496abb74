//! iproute2 plumbing: veth pairs, VXLAN devices, and in-namespace
//! operations via nsenter.

use anyhow::{anyhow, bail, Result};

use crate::core::cmd;

pub async fn link_exists(name: &str) -> bool {
    matches!(cmd::run("ip", &["link", "show", name]).await, Ok((0, _, _)))
}

/// Host-side view of a veth's existence; cheaper than `ip link show` when
/// scanning many endpoints.
pub fn link_exists_sys(name: &str) -> bool {
    std::path::Path::new("/sys/class/net").join(name).exists()
}

pub async fn create_veth_pair(host_name: &str, cont_name: &str, mtu: u32) -> Result<()> {
    let (code, _, stderr) = cmd::run(
        "ip",
        &[
            "link", "add", host_name, "mtu", &mtu.to_string(), "type", "veth", "peer", "name",
            cont_name, "mtu", &mtu.to_string(),
        ],
    )
    .await?;
    if code != 0 && !stderr.contains("File exists") {
        bail!("failed to create veth pair {host_name}/{cont_name}: {}", stderr.trim());
    }
    cmd::run_checked("ip", &["link", "set", host_name, "up"]).await?;
    Ok(())
}

pub async fn delete_link(name: &str) -> Result<()> {
    let (code, _, stderr) = cmd::run("ip", &["link", "delete", name]).await?;
    if code != 0 {
        let trimmed = stderr.trim();
        if trimmed.contains("Cannot find device") || trimmed.is_empty() {
            return Ok(());
        }
        bail!("failed to delete link {name}: {trimmed}");
    }
    Ok(())
}

/// Create a VXLAN device for a point-to-point tunnel. `df false` lets the
/// underlay fragment outer packets; without it overlay MTU caps at
/// underlay − 50.
pub async fn create_vxlan(
    name: &str,
    vni: u32,
    local_ip: &str,
    remote_ip: &str,
    dst_port: u16,
) -> Result<()> {
    let vni_s = vni.to_string();
    let port_s = dst_port.to_string();
    let (code, _, stderr) = cmd::run(
        "ip",
        &[
            "link", "add", name, "type", "vxlan", "id", &vni_s, "local", local_ip, "remote",
            remote_ip, "dstport", &port_s, "df", "false",
        ],
    )
    .await?;
    if code != 0 && !stderr.contains("File exists") {
        bail!("failed to create VXLAN interface {name}: {}", stderr.trim());
    }
    cmd::run_checked("ip", &["link", "set", name, "up"]).await?;
    Ok(())
}

/// Run an `ip` command inside a container's network namespace.
pub async fn nsenter_ip(pid: u32, args: &[&str]) -> Result<(i32, String, String)> {
    let pid_s = pid.to_string();
    let mut full: Vec<&str> = vec!["-t", &pid_s, "-n", "ip"];
    full.extend_from_slice(args);
    cmd::run("nsenter", &full).await
}

/// Set interface carrier on/off inside a container namespace. Simulates a
/// cable pull at the physical layer without touching addressing.
pub async fn set_carrier(pid: u32, interface: &str, up: bool) -> Result<()> {
    let state = if up { "on" } else { "off" };
    let (code, _, stderr) = nsenter_ip(pid, &["link", "set", interface, "carrier", state]).await?;
    if code != 0 {
        bail!(
            "failed to set carrier {state} on {interface}: {}",
            stderr.trim()
        );
    }
    Ok(())
}

/// Read the peer ifindex of a host-side veth (`ip link show <dev>` prints
/// `NN: veth@ifMM:` where MM is the peer's index in its namespace).
pub async fn peer_ifindex(host_veth: &str) -> Result<u32> {
    let stdout = cmd::run_checked("ip", &["-o", "link", "show", host_veth]).await?;
    // Format: "17: vh1a2b3c@if16: <BROADCAST,...> ..."
    let first = stdout
        .split(':')
        .nth(1)
        .ok_or_else(|| anyhow!("unexpected ip link output for {host_veth}"))?;
    let peer = first
        .split("@if")
        .nth(1)
        .ok_or_else(|| anyhow!("no peer index in ip link output for {host_veth}"))?;
    peer.trim()
        .parse()
        .map_err(|_| anyhow!("bad peer ifindex for {host_veth}: {peer}"))
}

/// Find the interface name with a given ifindex inside a container namespace.
pub async fn find_interface_by_ifindex(pid: u32, ifindex: u32) -> Result<Option<String>> {
    let (code, stdout, _) = nsenter_ip(pid, &["-o", "link", "show"]).await?;
    if code != 0 {
        return Ok(None);
    }
    for line in stdout.lines() {
        let mut parts = line.splitn(3, ':');
        let idx = parts.next().unwrap_or("").trim();
        let name = parts.next().unwrap_or("").trim();
        if idx.parse::<u32>().ok() == Some(ifindex) {
            // Strip any "@ifNN" suffix
            let name = name.split('@').next().unwrap_or(name);
            return Ok(Some(name.to_string()));
        }
    }
    Ok(None)
}

/// Rename an interface inside a container namespace: down → rename → up.
/// A "File exists" collision moves the conflicting interface aside first.
pub async fn rename_in_container(pid: u32, current: &str, target: &str) -> Result<()> {
    if current == target {
        return Ok(());
    }
    nsenter_ip(pid, &["link", "set", current, "down"]).await?;
    let (code, _, stderr) = nsenter_ip(pid, &["link", "set", current, "name", target]).await?;
    if code != 0 {
        if stderr.contains("File exists") {
            let aside = format!("{target}-old");
            nsenter_ip(pid, &["link", "set", target, "down"]).await?;
            nsenter_ip(pid, &["link", "set", target, "name", &aside]).await?;
            let (code2, _, stderr2) =
                nsenter_ip(pid, &["link", "set", current, "name", target]).await?;
            if code2 != 0 {
                bail!("rename {current} -> {target} failed after evicting: {}", stderr2.trim());
            }
        } else {
            bail!("rename {current} -> {target} failed: {}", stderr.trim());
        }
    }
    nsenter_ip(pid, &["link", "set", target, "up"]).await?;
    Ok(())
}

/// Detect the local IP by asking the kernel which source address would be
/// used to reach a public anycast resolver. Nothing is actually sent.
pub async fn detect_local_ip() -> String {
    if let Ok((0, stdout, _)) = cmd::run("ip", &["route", "get", "8.8.8.8"]).await {
        // Parse: "8.8.8.8 via 10.0.0.1 dev eth0 src 10.0.0.5 uid 0"
        let mut words = stdout.split_whitespace();
        while let Some(w) = words.next() {
            if w == "src" {
                if let Some(ip) = words.next() {
                    return ip.to_string();
                }
            }
        }
    }
    tracing::warn!("could not auto-detect local IP, using 127.0.0.1");
    "127.0.0.1".to_string()
}
