//! Boot readiness detection.
//!
//! "Container running" does not mean the network OS inside finished booting;
//! cEOS needs 30-60+ seconds after start for zerotouch/AAA/API bring-up, the
//! Cisco VMs far longer. Each vendor declares one probe kind; probes are
//! cheap enough to poll.

use anyhow::Result;
use archetype_types::ReadinessStatus;
use bollard::container::LogsOptions;
use bollard::Docker;
use futures::StreamExt;
use regex::RegexBuilder;

use crate::vendors::{cli_probe_command, vendor_config, ProbeKind};

fn ready(message: &str) -> ReadinessStatus {
    ReadinessStatus {
        is_ready: true,
        message: message.to_string(),
        progress_percent: Some(100),
    }
}

fn not_ready(message: &str, progress: Option<u8>) -> ReadinessStatus {
    ReadinessStatus {
        is_ready: false,
        message: message.to_string(),
        progress_percent: progress,
    }
}

/// Tail recent container logs.
async fn recent_logs(docker: &Docker, container: &str, tail_lines: u32) -> Result<String> {
    let mut stream = docker.logs(
        container,
        Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail_lines.to_string(),
            ..Default::default()
        }),
    );
    let mut collected = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(output) => collected.push_str(&output.to_string()),
            Err(_) => break,
        }
    }
    Ok(collected)
}

/// Match logs against the completion pattern; report the highest progress
/// pattern seen otherwise.
pub fn evaluate_log_pattern(
    logs: &str,
    pattern: &str,
    progress_patterns: &[(&str, u8)],
) -> ReadinessStatus {
    let completed = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map(|re| re.is_match(logs))
        .unwrap_or(false);
    if completed {
        return ready("Boot complete");
    }
    let mut max_progress: Option<u8> = None;
    for (progress_pattern, percent) in progress_patterns {
        let hit = RegexBuilder::new(progress_pattern)
            .case_insensitive(true)
            .build()
            .map(|re| re.is_match(logs))
            .unwrap_or(false);
        if hit {
            max_progress = Some(max_progress.map_or(*percent, |p| p.max(*percent)));
        }
    }
    not_ready("Boot in progress", max_progress)
}

/// Container-side readiness check dispatched by vendor probe kind.
pub async fn check_container(docker: &Docker, container: &str, kind: &str) -> Result<ReadinessStatus> {
    let vendor = vendor_config(kind);
    match vendor.probe {
        ProbeKind::None => Ok(ready("No readiness probe configured")),
        ProbeKind::LogPattern => {
            let running = crate::core::docker::container_pid(docker, container)
                .await?
                .is_some();
            if !running {
                return Ok(not_ready("Container not running", Some(0)));
            }
            let logs = recent_logs(docker, container, 500).await?;
            Ok(evaluate_log_pattern(
                &logs,
                vendor.readiness_pattern,
                vendor.progress_patterns,
            ))
        }
        ProbeKind::CliProbe => {
            let Some((command, expected)) = cli_probe_command(kind) else {
                return Ok(ready("No CLI probe configured"));
            };
            let output =
                super::docker::extract::exec_in_container(docker, container, command).await?;
            let hit = RegexBuilder::new(expected)
                .case_insensitive(true)
                .build()
                .map(|re| re.is_match(&output))
                .unwrap_or(false);
            if hit {
                Ok(ready("CLI probe matched"))
            } else {
                Ok(not_ready("CLI probe output not ready", None))
            }
        }
        ProbeKind::Ssh => {
            // SSH probing applies to VM kinds; a container with this probe
            // kind uses its management IP directly.
            Ok(not_ready("SSH probe requires management IP", None))
        }
    }
}

/// TCP probe of an SSH port. Used for VM kinds once a management IP is
/// known.
pub async fn probe_ssh_port(ip: &str, timeout_secs: u64) -> bool {
    let addr = format!("{ip}:22");
    matches!(
        tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            tokio::net::TcpStream::connect(&addr),
        )
        .await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_pattern_matches_completion() {
        let status = evaluate_log_pattern("... SuperServer is ready ...", r"SuperServer is ready", &[]);
        assert!(status.is_ready);
        assert_eq!(status.progress_percent, Some(100));
    }

    #[test]
    fn log_pattern_reports_highest_progress() {
        let progress = [("ZeroTouch", 20u8), ("AAA", 40u8), ("localhost-", 80u8)];
        let status = evaluate_log_pattern("ZeroTouch disabled\nAAA up", "never-matches", &progress);
        assert!(!status.is_ready);
        assert_eq!(status.progress_percent, Some(40));
    }

    #[test]
    fn log_pattern_without_progress_is_unknown() {
        let status = evaluate_log_pattern("booting...", "ready-pattern", &[]);
        assert!(!status.is_ready);
        assert_eq!(status.progress_percent, None);
    }

    #[test]
    fn log_pattern_is_case_insensitive() {
        let status = evaluate_log_pattern("STARTUP COMPLETE", r"Startup complete", &[]);
        assert!(status.is_ready);
    }
}
