//! cEOS boot artifacts.
//!
//! cEOS has a platform detection race: if network interfaces are not yet
//! visible when systemd services start, platform probing fails and boot
//! wedges. The flash layout written here runs a shell script before
//! /sbin/init that waits for the expected interface count and normalizes
//! interface names to a contiguous eth1..N in ifindex order.

use std::path::Path;

use anyhow::{Context, Result};

/// Runs before /sbin/init inside the container.
pub const IF_WAIT_SCRIPT: &str = r#"#!/bin/sh

# Validate CLAB_INTFS environment variable
REQUIRED_INTFS_NUM=${CLAB_INTFS:-0}
if ! echo "$REQUIRED_INTFS_NUM" | grep -qE '^[0-9]+$' || [ "$REQUIRED_INTFS_NUM" -eq 0 ]; then
    echo "if-wait: CLAB_INTFS not set or invalid, skipping interface wait"
    REQUIRED_INTFS_NUM=0
fi

TIMEOUT=300  # 5 minute timeout
WAIT_TIME=0

int_calc() {
    if [ ! -d "/sys/class/net/" ]; then
        echo "if-wait: /sys/class/net/ not accessible"
        AVAIL_INTFS_NUM=0
        return 1
    fi

    # Count eth1+ interfaces (excluding eth0 which is management)
    AVAIL_INTFS_NUM=$(ls -1 /sys/class/net/ 2>/dev/null | grep -cE '^eth[1-9]')
    return 0
}

normalize_eth_names() {
    if [ "$REQUIRED_INTFS_NUM" -le 0 ]; then
        return 0
    fi

    missing=0
    i=1
    while [ "$i" -le "$REQUIRED_INTFS_NUM" ]; do
        if [ ! -e "/sys/class/net/eth${i}" ]; then
            missing=1
            break
        fi
        i=$((i + 1))
    done

    if [ "$missing" -eq 0 ]; then
        return 0
    fi

    echo "if-wait: Normalizing eth interface names before init"

    tmpfile="/tmp/if-wait-eths"
    ip -o link show | awk -F': ' '/: eth[0-9]+/ {name=$2; sub(/@.*/,"",name); print $1, name}' | sort -n > "$tmpfile"

    # Rename all eth* to unique temp names to avoid collisions
    while read -r idx name; do
        ip link set "$name" down 2>/dev/null || true
        ip link set "$name" name "tmp_ceos_${idx}" 2>/dev/null || true
    done < "$tmpfile"

    # Rename temp interfaces to eth1..ethN in ifindex order
    i=1
    while read -r idx _; do
        if [ "$i" -le "$REQUIRED_INTFS_NUM" ]; then
            ip link set "tmp_ceos_${idx}" name "eth${i}" 2>/dev/null || true
            ip link set "eth${i}" up 2>/dev/null || true
            i=$((i + 1))
        fi
    done < "$tmpfile"
}

# Only wait for interfaces if CLAB_INTFS is set
if [ "$REQUIRED_INTFS_NUM" -gt 0 ]; then
    echo "if-wait: Waiting for $REQUIRED_INTFS_NUM interfaces (timeout: ${TIMEOUT}s)"

    while [ "$WAIT_TIME" -lt "$TIMEOUT" ]; do
        if ! int_calc; then
            echo "if-wait: Failed to check interfaces, continuing..."
            break
        fi

        if [ "$AVAIL_INTFS_NUM" -ge "$REQUIRED_INTFS_NUM" ]; then
            echo "if-wait: Found $AVAIL_INTFS_NUM interfaces (required: $REQUIRED_INTFS_NUM)"
            break
        fi

        # Log every 5 seconds to reduce noise
        if [ $((WAIT_TIME % 5)) -eq 0 ]; then
            echo "if-wait: Have $AVAIL_INTFS_NUM of $REQUIRED_INTFS_NUM interfaces (waited ${WAIT_TIME}s)"
        fi
        sleep 1
        WAIT_TIME=$((WAIT_TIME + 1))
    done

    if [ "$WAIT_TIME" -ge "$TIMEOUT" ]; then
        echo "if-wait: Timeout reached, proceeding with $AVAIL_INTFS_NUM interfaces"
    fi

    normalize_eth_names
fi

echo "if-wait: Starting init"
exec /sbin/init "$@"
"#;

/// Environment cEOS containers boot with.
pub const CEOS_ENV: &[(&str, &str)] = &[
    ("EOS_PLATFORM", "ceoslab"),
    ("CEOS", "1"),
    ("container", "docker"),
    ("ETBA", "1"),
    ("SKIP_ZEROTOUCH_BARRIER_IN_SYSDBINIT", "1"),
    ("INTFTYPE", "eth"),
    ("MGMT_INTF", "eth0"),
    ("CEOS_NOZEROTOUCH", "1"),
];

/// Write the flash layout for one cEOS node:
/// - startup-config (topology blob > previously extracted > minimal default)
/// - zerotouch-config disabling ZTP
/// - systemd environment drop-in (systemd units do not inherit container env)
/// - if-wait.sh entry wrapper
pub fn setup_ceos_directories(
    workspace: &Path,
    lab_id: &str,
    node_name: &str,
    display_name: Option<&str>,
    startup_config: Option<&str>,
) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let node_dir = workspace.join(lab_id).join("configs").join(node_name);
    let flash_dir = node_dir.join("flash");
    std::fs::create_dir_all(&flash_dir)
        .with_context(|| format!("failed to create {}", flash_dir.display()))?;

    let systemd_dir = node_dir.join("systemd");
    std::fs::create_dir_all(&systemd_dir)?;
    let env_line: String = CEOS_ENV
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ");
    std::fs::write(
        systemd_dir.join("ceos-env.conf"),
        format!("[Manager]\nDefaultEnvironment={env_line}\n"),
    )?;

    let flash_config = flash_dir.join("startup-config");
    let extracted = node_dir.join("startup-config");
    if let Some(config) = startup_config {
        std::fs::write(&flash_config, config)?;
    } else if extracted.exists() {
        std::fs::copy(&extracted, &flash_config)?;
    } else if !flash_config.exists() {
        let hostname = display_name.unwrap_or(node_name);
        let minimal = format!(
            "! Minimal cEOS startup config\nhostname {hostname}\n!\nno aaa root\n!\nusername admin privilege 15 role network-admin nopassword\n!\n"
        );
        std::fs::write(&flash_config, minimal)?;
    }

    let zerotouch = flash_dir.join("zerotouch-config");
    if !zerotouch.exists() {
        std::fs::write(&zerotouch, "DISABLE=True\n")?;
    }

    let if_wait = flash_dir.join("if-wait.sh");
    std::fs::write(&if_wait, IF_WAIT_SCRIPT)?;
    std::fs::set_permissions(&if_wait, std::fs::Permissions::from_mode(0o755))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flash_layout_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        setup_ceos_directories(dir.path(), "lab1", "sw1", Some("spine-1"), None).unwrap();

        let flash = dir.path().join("lab1/configs/sw1/flash");
        assert!(flash.join("if-wait.sh").exists());
        assert_eq!(
            std::fs::read_to_string(flash.join("zerotouch-config")).unwrap(),
            "DISABLE=True\n"
        );
        let config = std::fs::read_to_string(flash.join("startup-config")).unwrap();
        assert!(config.contains("hostname spine-1"));
        let env = std::fs::read_to_string(
            dir.path().join("lab1/configs/sw1/systemd/ceos-env.conf"),
        )
        .unwrap();
        assert!(env.contains("EOS_PLATFORM=ceoslab"));
        assert!(env.contains("CEOS_NOZEROTOUCH=1"));
    }

    #[test]
    fn topology_config_wins_over_default() {
        let dir = tempfile::tempdir().unwrap();
        setup_ceos_directories(dir.path(), "lab1", "sw1", None, Some("hostname custom\n")).unwrap();
        let config =
            std::fs::read_to_string(dir.path().join("lab1/configs/sw1/flash/startup-config"))
                .unwrap();
        assert_eq!(config, "hostname custom\n");
    }

    #[test]
    fn extracted_config_reused_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let node_dir = dir.path().join("lab1/configs/sw1");
        std::fs::create_dir_all(&node_dir).unwrap();
        std::fs::write(node_dir.join("startup-config"), "hostname extracted\n").unwrap();
        setup_ceos_directories(dir.path(), "lab1", "sw1", None, None).unwrap();
        let config = std::fs::read_to_string(node_dir.join("flash/startup-config")).unwrap();
        assert_eq!(config, "hostname extracted\n");
    }

    #[test]
    fn if_wait_counts_and_normalizes() {
        assert!(IF_WAIT_SCRIPT.contains("grep -cE '^eth[1-9]'"));
        assert!(IF_WAIT_SCRIPT.contains("normalize_eth_names"));
        assert!(IF_WAIT_SCRIPT.contains("exec /sbin/init"));
    }
}
