//! Subprocess helpers shared by the OVS and iproute layers.

use anyhow::{bail, Context, Result};
use tokio::process::Command;

/// Run a command, returning (exit_code, stdout, stderr).
pub async fn run(cmd: &str, args: &[&str]) -> Result<(i32, String, String)> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to spawn {cmd}"))?;
    Ok((
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    ))
}

/// Run a command and fail with its stderr when it exits nonzero.
pub async fn run_checked(cmd: &str, args: &[&str]) -> Result<String> {
    let (code, stdout, stderr) = run(cmd, args).await?;
    if code != 0 {
        bail!("command `{cmd} {}` failed: {}", args.join(" "), stderr.trim());
    }
    Ok(stdout)
}

/// Run a command ignoring failure. For best-effort teardown paths.
pub async fn run_ignore(cmd: &str, args: &[&str]) {
    let _ = Command::new(cmd).args(args).output().await;
}
