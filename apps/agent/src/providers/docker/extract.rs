//! Container config extraction and post-boot command execution.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::sync::OnceLock;

use anyhow::{anyhow, bail, Context, Result};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;

use crate::core::cmd;
use crate::vendors::{vendor_config, ExtractMethod};

use super::nvram;

/// Containers whose post-boot commands already ran. Cleared on stop so the
/// commands run again on the next start.
fn post_boot_completed() -> &'static Mutex<HashSet<String>> {
    static CACHE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashSet::new()))
}

pub fn clear_post_boot_cache(container_name: &str) {
    post_boot_completed().lock().unwrap().remove(container_name);
}

/// Run a command inside the container, bash-wrapped so pipes work.
pub async fn exec_in_container(docker: &Docker, container: &str, command: &str) -> Result<String> {
    let exec = docker
        .create_exec(
            container,
            CreateExecOptions {
                cmd: Some(vec!["bash", "-c", command]),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("failed to create exec in {container}"))?;

    let mut collected = String::new();
    match docker.start_exec(&exec.id, None).await? {
        StartExecResults::Attached { mut output, .. } => {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(msg) => collected.push_str(&msg.to_string()),
                    Err(err) => bail!("exec stream error in {container}: {err}"),
                }
            }
        }
        StartExecResults::Detached => {}
    }
    Ok(collected)
}

/// Extract a device config via `docker exec`.
pub async fn extract_via_docker(docker: &Docker, container: &str, command: &str) -> Result<String> {
    let output = exec_in_container(docker, container, command).await?;
    let trimmed = output.trim();
    if trimmed.is_empty() {
        bail!("empty config output from {container}");
    }
    Ok(trimmed.to_string())
}

/// Extract a device config over SSH to the container's management IP.
pub async fn extract_via_ssh(
    container_ip: &str,
    user: &str,
    password: &str,
    command: &str,
) -> Result<String> {
    let target = format!("{user}@{container_ip}");
    let (code, stdout, stderr) = cmd::run(
        "sshpass",
        &[
            "-p",
            password,
            "ssh",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "ConnectTimeout=10",
            &target,
            command,
        ],
    )
    .await?;
    if code != 0 {
        bail!("ssh extraction from {container_ip} failed: {}", stderr.trim());
    }
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        bail!("empty config output from {container_ip}");
    }
    Ok(trimmed.to_string())
}

/// Read config from an IOL container's NVRAM file in the workspace.
pub fn extract_from_iol_nvram(workspace: &Path, lab_id: &str, node_name: &str) -> Result<String> {
    let nvram_path = workspace
        .join(lab_id)
        .join("configs")
        .join(node_name)
        .join("iol-data")
        .join("nvram_00001");
    let data = std::fs::read(&nvram_path)
        .with_context(|| format!("failed to read {}", nvram_path.display()))?;
    nvram::parse_iol_nvram(&data)
        .ok_or_else(|| anyhow!("no parseable config in {}", nvram_path.display()))
}

/// Persist an extracted config at the canonical workspace location.
pub fn save_config(workspace: &Path, lab_id: &str, node_name: &str, config: &str) -> Result<()> {
    let dir = workspace.join(lab_id).join("configs").join(node_name);
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join("startup-config");
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, config)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

/// Extract one node's config by the vendor-declared method and save it.
pub async fn extract_node_config(
    docker: &Docker,
    workspace: &Path,
    lab_id: &str,
    node_name: &str,
    container_name: &str,
    kind: &str,
    container_ip: Option<&str>,
) -> Result<String> {
    let vendor = vendor_config(kind);
    let config = match vendor.extract_method {
        ExtractMethod::Docker => {
            extract_via_docker(docker, container_name, vendor.extract_command).await?
        }
        ExtractMethod::Ssh => {
            let ip = container_ip
                .ok_or_else(|| anyhow!("no management IP for {container_name}"))?;
            extract_via_ssh(ip, vendor.username, vendor.password, vendor.extract_command).await?
        }
        ExtractMethod::None if kind == "cisco_iol" => {
            extract_from_iol_nvram(workspace, lab_id, node_name)?
        }
        ExtractMethod::None | ExtractMethod::Serial => {
            bail!("kind {kind} does not support container extraction")
        }
    };
    save_config(workspace, lab_id, node_name, &config)?;
    Ok(config)
}

/// Run the vendor's post-boot commands once per container start.
pub async fn run_post_boot_commands(docker: &Docker, container_name: &str, kind: &str) -> Result<()> {
    let vendor = vendor_config(kind);
    if vendor.post_boot_commands.is_empty() {
        return Ok(());
    }
    {
        let cache = post_boot_completed().lock().unwrap();
        if cache.contains(container_name) {
            return Ok(());
        }
    }
    for command in vendor.post_boot_commands {
        if let Err(err) = exec_in_container(docker, container_name, command).await {
            tracing::warn!(container = container_name, error = %err, "post-boot command failed");
        }
    }
    post_boot_completed()
        .lock()
        .unwrap()
        .insert(container_name.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_config_is_atomic_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        save_config(dir.path(), "lab1", "r1", "hostname r1\n").unwrap();
        let body =
            std::fs::read_to_string(dir.path().join("lab1/configs/r1/startup-config")).unwrap();
        assert_eq!(body, "hostname r1\n");
        assert!(!dir.path().join("lab1/configs/r1/startup-config.tmp").exists());
    }

    #[test]
    fn iol_nvram_extraction_reads_workspace_file() {
        let dir = tempfile::tempdir().unwrap();
        let iol_dir = dir.path().join("lab1/configs/r1/iol-data");
        std::fs::create_dir_all(&iol_dir).unwrap();
        let mut data = vec![0u8; 80];
        data.extend_from_slice(b"hostname R1\n!\nend\n");
        data.push(0);
        std::fs::write(iol_dir.join("nvram_00001"), &data).unwrap();

        let config = extract_from_iol_nvram(dir.path(), "lab1", "r1").unwrap();
        assert!(config.contains("hostname R1"));
    }

    #[test]
    fn post_boot_cache_clears() {
        post_boot_completed().lock().unwrap().insert("c1".into());
        clear_post_boot_cache("c1");
        assert!(!post_boot_completed().lock().unwrap().contains("c1"));
    }
}
