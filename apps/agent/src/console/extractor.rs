//! Serial console config extraction.
//!
//! Two paths: piggyback on an active web console session's PTY, or open a
//! dedicated `virsh console --force` under the per-domain lock. Both drive
//! the same login/enable/paging/execute sequence with a prompt-pattern
//! fallback chain and first-boot onboarding handling, then clean and
//! validate the captured output.

use std::collections::HashSet;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

use crate::config::settings;
use crate::console::injector::{ExpectError, PtyInjector};
use crate::console::lock::{self, ExtractionSession};
use crate::console::registry::{self, WsFrame};
use crate::vendors::{vendor_config, VendorConfig};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("console busy: {0}")]
    Busy(String),
    #[error("console timeout: {0}")]
    Timeout(String),
    #[error("console closed: {0}")]
    Eof(String),
    #[error("device rejected command: {0}")]
    Cli(String),
    #[error("{0}")]
    ExecMode(String),
    #[error("extracted output failed validation: {0}")]
    Invalid(String),
    #[error("{0}")]
    Other(String),
}

impl From<ExpectError> for ExtractError {
    fn from(err: ExpectError) -> Self {
        match err {
            ExpectError::Timeout(d) => ExtractError::Timeout(format!("no match within {d:?}")),
            ExpectError::Eof => ExtractError::Eof("PTY fd returned empty read (closed)".into()),
            other => ExtractError::Other(other.to_string()),
        }
    }
}

/// Retryable errors back off (4 s, 8 s) before the caller gives up.
pub fn is_retryable(err: &ExtractError) -> bool {
    matches!(err, ExtractError::Busy(_) | ExtractError::Timeout(_))
}

// ---------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------

const CISCO_MODE_PROMPT: &str = r"[\w.\-]+(?:\([^)\r\n]+\))?[>#]\s*$";
const GENERIC_LINE_PROMPT: &str = r"^[^\r\n]*[>#]\s*$";

/// Vendor pattern first, then the Cisco mode prompt, then a generic
/// any-line-ending-in-delimiter fallback.
pub fn prompt_patterns(vendor_pattern: &str) -> Vec<String> {
    let mut patterns = vec![vendor_pattern.to_string()];
    if vendor_pattern != CISCO_MODE_PROMPT {
        patterns.push(CISCO_MODE_PROMPT.to_string());
    }
    if vendor_pattern != GENERIC_LINE_PROMPT {
        patterns.push(GENERIC_LINE_PROMPT.to_string());
    }
    patterns
}

/// NX-OS first-boot password policy: 8+ chars with lower, upper, digit and
/// symbol.
pub fn is_strong_admin_password(password: &str) -> bool {
    password.len() >= 8
        && password.chars().any(|c| c.is_ascii_lowercase())
        && password.chars().any(|c| c.is_ascii_uppercase())
        && password.chars().any(|c| c.is_ascii_digit())
        && password.chars().any(|c| !c.is_ascii_alphanumeric())
}

/// Pick a first-boot admin password: the configured one when it satisfies
/// the policy, otherwise a deterministic strong default.
pub fn bootstrap_admin_password(configured: &str) -> String {
    let candidate = configured.trim();
    if is_strong_admin_password(candidate) {
        candidate.to_string()
    } else {
        "Archetype123!".to_string()
    }
}

fn ansi_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").unwrap())
}

/// Strip ANSI noise, command echoes, prompt lines and serial banners from
/// captured output.
pub fn clean_config(raw_output: &str, command: &str) -> String {
    let output = ansi_regex().replace_all(raw_output, "");
    let output = output.replace('\r', "");

    let cmd_pattern = Regex::new(&format!(
        r"(?i)^\s*(?:\S+(?:\([^)\r\n]+\))?[>#]\s*)?{}\s*$",
        regex::escape(command)
    ))
    .unwrap();
    let prompt_only = Regex::new(r"^\s*[A-Za-z0-9_.\-]+(?:\([^)\r\n]+\))?[>#]\s*$").unwrap();

    let mut lines: Vec<&str> = Vec::new();
    for line in output.lines() {
        let stripped = line.trim();
        if cmd_pattern.is_match(line) {
            continue;
        }
        if stripped.is_empty() {
            lines.push(line);
            continue;
        }
        if stripped.starts_with("Building configuration")
            || stripped.starts_with("Connected to domain")
            || stripped.starts_with("Escape character is")
            || stripped == "--More--"
        {
            continue;
        }
        if prompt_only.is_match(line) {
            continue;
        }
        lines.push(line);
    }

    while lines.first().map(|l| l.trim().is_empty()).unwrap_or(false) {
        lines.remove(0);
    }
    while lines.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
        lines.pop();
    }
    lines.join("\n")
}

const CLI_ERROR_MARKERS: &[&str] = &[
    "% invalid input",
    "% incomplete command",
    "% ambiguous command",
    "% unknown command",
];

const CONFIG_MARKERS: &[&str] = &[
    "current configuration",
    "version ",
    "hostname ",
    "interface ",
    "!",
];

/// Does the cleaned output look like a real configuration payload?
pub fn validate_extracted_config(
    config: &str,
    command: &str,
    paging_disable: &str,
) -> Result<(), String> {
    let text = config.trim();
    if text.is_empty() {
        return Err("empty output".into());
    }
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() < 2 {
        return Err(format!("too few lines ({})", lines.len()));
    }

    let lowered = text.to_lowercase();
    for marker in CLI_ERROR_MARKERS {
        if lowered.contains(marker) {
            return Err(format!("cli error marker detected: {marker}"));
        }
    }

    let command_l = command.trim().to_lowercase();
    let paging_l = paging_disable.trim().to_lowercase();
    let prompt_prefix = Regex::new(r"^\S+[>#]\s*").unwrap();
    let all_echo = lines.iter().all(|line| {
        let stripped = prompt_prefix.replace(line.trim(), "").trim().to_lowercase();
        stripped == command_l || (!paging_l.is_empty() && stripped == paging_l)
    });
    if all_echo {
        return Err("output contains only command echoes".into());
    }

    if text.len() < 64 && !CONFIG_MARKERS.iter().any(|m| lowered.contains(m)) {
        return Err(format!("output too short ({} bytes)", text.len()));
    }
    Ok(())
}

// ---------------------------------------------------------------------
// The console drive sequence
// ---------------------------------------------------------------------

/// Onboarding prompts that may appear before the login prompt on first
/// boot, in pattern order after the prompt chain and login patterns.
fn login_patterns(prompts: &[String]) -> Vec<String> {
    let mut patterns: Vec<String> = prompts.to_vec();
    patterns.extend(
        [
            r"[Uu]sername:",
            r"[Ll]ogin:",
            r"[Pp]assword:",
            r"Abort\s+Power\s+On\s+Auto\s+Provisioning[^\r\n]*\(yes/no\)\[no\]:",
            r"Would you like to enter (?:the )?(?:initial|basic) configuration dialog[^\r\n]*\(yes/no\)[^\r\n]*:",
            r"Would you like to enforce secure password standard\s*\(yes/no\)\s*\[y\]:",
            r#"Enter the password for "admin":"#,
            r#"Confirm the password for "admin":"#,
            r"Wrong Password,\s*Reason:",
            r"[Ll]ogin incorrect",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    patterns
}

/// Drive login and first-boot onboarding until a CLI prompt appears.
/// Returns the matched prompt text.
fn handle_login(
    injector: &mut PtyInjector,
    vendor: &VendorConfig,
    timeout: Duration,
) -> Result<String, ExtractError> {
    let prompts = prompt_patterns(vendor.prompt_pattern);
    let patterns = login_patterns(&prompts);
    let pattern_refs: Vec<&str> = patterns.iter().map(|s| s.as_str()).collect();
    let prompt_count = prompts.len();

    let bootstrap = bootstrap_admin_password(vendor.password);
    let mut candidates: Vec<String> = Vec::new();
    if !vendor.password.trim().is_empty() {
        candidates.push(vendor.password.trim().to_string());
    }
    if !candidates.contains(&bootstrap) {
        candidates.push(bootstrap.clone());
    }
    candidates.push(String::new());
    let mut candidate_index = 0usize;

    // Wake the console.
    let _ = injector.sendline("");

    let step_timeout = Duration::from_secs(timeout.as_secs().clamp(2, 8));
    let deadline = std::time::Instant::now() + timeout.max(Duration::from_secs(5));
    while std::time::Instant::now() < deadline {
        let matched = match injector.expect_capture(&pattern_refs, step_timeout) {
            Ok(m) => m,
            Err(ExpectError::Timeout(_)) => {
                // Nothing on the wire; nudge and retry.
                let _ = injector.sendline("");
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        if matched.index < prompt_count {
            return Ok(matched.matched.trim_end().to_string());
        }
        match matched.index - prompt_count {
            0 | 1 => {
                // Username: / login:
                injector.sendline(vendor.username)?;
            }
            2 => {
                // Password:
                let password = candidates
                    .get(candidate_index)
                    .cloned()
                    .unwrap_or_default();
                injector.sendline(&password)?;
            }
            3 => {
                // Abort POAP so the switch drops to a normal login.
                injector.sendline("yes")?;
            }
            4 => {
                // Initial configuration dialog.
                injector.sendline("no")?;
            }
            5 => {
                // Enforce secure password standard [y].
                injector.sendline("y")?;
            }
            6 | 7 => {
                // Enter/confirm admin password; must satisfy policy.
                injector.sendline(&bootstrap)?;
            }
            _ => {
                // Wrong password / login incorrect: advance the candidate.
                candidate_index = (candidate_index + 1).min(candidates.len() - 1);
            }
        }
    }
    Err(ExtractError::Timeout("no CLI prompt after login sequence".into()))
}

/// Move from user EXEC (`>`) to privileged mode (`#`).
fn enter_enable_mode(
    injector: &mut PtyInjector,
    vendor: &VendorConfig,
    prompts: &[String],
) -> Result<String, ExtractError> {
    injector.sendline("enable")?;
    let mut patterns: Vec<&str> = vec![r"[Pp]assword:"];
    let prompt_refs: Vec<&str> = prompts.iter().map(|s| s.as_str()).collect();
    patterns.extend(&prompt_refs);
    patterns.push(r"% ?[Ii]nvalid input.*");

    let matched = injector.expect_capture(&patterns, Duration::from_secs(5))?;
    if matched.index == 0 {
        injector.sendline(vendor.enable_password)?;
        let matched = injector.expect_capture(&prompt_refs, Duration::from_secs(5))?;
        return Ok(matched.matched.trim_end().to_string());
    }
    Ok(matched.matched.trim_end().to_string())
}

/// Options for one extraction drive.
pub struct DriveOptions {
    pub command: String,
    pub timeout: Duration,
}

/// Run the full login → enable → paging-off → execute sequence on an
/// already-open PTY. Blocking; call from a worker thread.
pub fn drive_extraction(
    injector: &mut PtyInjector,
    vendor: &VendorConfig,
    options: &DriveOptions,
) -> Result<String, ExtractError> {
    let mut prompt = handle_login(injector, vendor, options.timeout)?;
    let prompts = prompt_patterns(vendor.prompt_pattern);
    let prompt_refs: Vec<&str> = prompts.iter().map(|s| s.as_str()).collect();

    // Privileged commands need `#`. Anything but a `#` prompt after the
    // enable attempt means enable failed (wrong password, or the CLI
    // rejected the command outright).
    if prompt.trim_end().ends_with('>') {
        prompt = enter_enable_mode(injector, vendor, &prompts)?;
        if !prompt.trim_end().ends_with('#') && options.command.contains("running-config") {
            return Err(ExtractError::ExecMode(
                "Device remained in user EXEC mode".into(),
            ));
        }
    }

    if !vendor.paging_disable.is_empty() {
        injector.sendline(vendor.paging_disable)?;
        let _ = injector.expect_any(&prompt_refs, Duration::from_secs(5));
    }

    injector.sendline(&options.command)?;
    let matched = injector.expect_capture(&prompt_refs, options.timeout)?;
    let raw = matched.before;

    let cleaned = clean_config(&raw, &options.command);
    if let Err(reason) = validate_extracted_config(&cleaned, &options.command, vendor.paging_disable)
    {
        let lowered = cleaned.to_lowercase();
        if CLI_ERROR_MARKERS.iter().any(|m| lowered.contains(m)) {
            return Err(ExtractError::Cli(reason));
        }
        return Err(ExtractError::Invalid(reason));
    }
    Ok(cleaned)
}

// ---------------------------------------------------------------------
// Piggyback path
// ---------------------------------------------------------------------

/// Reuse an active web console session's PTY for extraction. The user's
/// reader/writer pause behind the flow gates and watch the automation live.
pub fn piggyback_extract(domain: &str, command: &str, kind: &str) -> Result<String, ExtractError> {
    let session = registry::get_session(domain)
        .ok_or_else(|| ExtractError::Busy(format!("no active console session for {domain}")))?;
    let vendor = vendor_config(kind);

    // Serialize against session teardown; bounded so a wedged session does
    // not hang extraction forever.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let _guard = loop {
        match session.session_mutex.try_lock() {
            Ok(guard) => break guard,
            Err(std::sync::TryLockError::WouldBlock) => {
                if std::time::Instant::now() >= deadline {
                    return Err(ExtractError::Busy(format!(
                        "session mutex busy for {domain}"
                    )));
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(err) => return Err(ExtractError::Other(err.to_string())),
        }
    };

    session.pause_flow();
    registry::set_console_control_state(domain, "read_only", "Configuration in progress…");
    // Let in-flight reads drain before automation writes.
    std::thread::sleep(Duration::from_millis(300));

    let ws_tx = session.ws_tx.clone();
    let mut injector = PtyInjector::with_forward(
        session.master_fd,
        Box::new(move |bytes| {
            let _ = ws_tx.send(WsFrame::Data(bytes.to_vec()));
        }),
    );
    let options = DriveOptions {
        command: command.to_string(),
        timeout: Duration::from_secs(settings().extraction_timeout_secs),
    };
    let result = drive_extraction(&mut injector, vendor, &options);

    registry::set_console_control_state(domain, "interactive", "");
    registry::clear_console_control_state(domain);
    session.resume_flow();

    result
}

// ---------------------------------------------------------------------
// Direct virsh path
// ---------------------------------------------------------------------

/// Open a dedicated virsh console under a PTY and drive extraction there.
/// Holds the per-domain lock for the duration.
pub fn direct_virsh_extract(domain: &str, command: &str, kind: &str) -> Result<String, ExtractError> {
    let cfg = settings();
    let _lock = lock::console_lock(
        domain,
        Duration::from_secs(cfg.console_lock_timeout_secs),
        true,
    )
    .map_err(|err| ExtractError::Busy(err.to_string()))?;
    let _session = ExtractionSession::begin(domain);

    let (master, child) = spawn_virsh_console(domain).map_err(ExtractError::Other)?;
    let vendor = vendor_config(kind);
    let options = DriveOptions {
        command: command.to_string(),
        timeout: Duration::from_secs(cfg.extraction_timeout_secs),
    };

    let mut injector = PtyInjector::new(master.as_raw_fd());
    let result = drive_extraction(&mut injector, vendor, &options);

    cleanup_virsh_child(child);
    drop(master);
    result
}

/// Spawn a command with its stdio wired to a fresh PTY slave; returns the
/// master fd and the child.
pub fn spawn_under_pty(
    program: &str,
    args: &[&str],
) -> Result<(OwnedFd, std::process::Child), String> {
    use nix::pty::{openpty, OpenptyResult};
    use std::os::fd::{FromRawFd, IntoRawFd};
    use std::process::{Command, Stdio};

    let OpenptyResult { master, slave } = openpty(None, None).map_err(|err| err.to_string())?;
    let slave_fd = slave.into_raw_fd();
    let dup = |fd: i32| -> Result<i32, String> {
        let duped = unsafe { libc::dup(fd) };
        if duped < 0 {
            Err(std::io::Error::last_os_error().to_string())
        } else {
            Ok(duped)
        }
    };
    let stdout_fd = dup(slave_fd)?;
    let stderr_fd = dup(slave_fd)?;
    let (stdin, stdout, stderr) = unsafe {
        (
            Stdio::from_raw_fd(slave_fd),
            Stdio::from_raw_fd(stdout_fd),
            Stdio::from_raw_fd(stderr_fd),
        )
    };
    let child = Command::new(program)
        .args(args)
        .stdin(stdin)
        .stdout(stdout)
        .stderr(stderr)
        .spawn()
        .map_err(|err| format!("failed to spawn {program}: {err}"))?;
    Ok((master, child))
}

/// Spawn `virsh console --force` under a PTY.
pub fn spawn_virsh_console(domain: &str) -> Result<(OwnedFd, std::process::Child), String> {
    let uri = settings().libvirt_uri.clone();
    spawn_under_pty(
        "virsh",
        &["-c", &uri, "console", domain, "--force"],
    )
}

/// Spawn `docker exec -it <container> <shell>` under a PTY for container
/// web consoles.
pub fn spawn_docker_exec_console(
    container: &str,
    shell: &str,
) -> Result<(OwnedFd, std::process::Child), String> {
    spawn_under_pty("docker", &["exec", "-it", container, shell])
}

/// SIGTERM then SIGKILL, bounded around a second total.
pub fn cleanup_virsh_child(mut child: std::process::Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    let _ = kill(pid, Signal::SIGTERM);
    for _ in 0..10 {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => std::thread::sleep(Duration::from_millis(100)),
            Err(_) => break,
        }
    }
    let _ = kill(pid, Signal::SIGKILL);
    let _ = child.wait();
}

// ---------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------

/// Extract a VM's config: piggyback first, then the direct virsh session,
/// with backoff on retryable failures (two retries at 4 s and 8 s).
pub async fn extract_vm_config(domain: &str, kind: &str, command: &str) -> Result<String, ExtractError> {
    let mut delays = [Duration::from_secs(4), Duration::from_secs(8)].into_iter();
    loop {
        let result = extract_vm_config_once(domain, kind, command).await;
        match &result {
            Err(err) if is_retryable(err) => {
                if let Some(delay) = delays.next() {
                    tracing::warn!(domain, error = %err, "extraction retryable failure, backing off");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }
            _ => {}
        }
        return result;
    }
}

async fn extract_vm_config_once(
    domain: &str,
    kind: &str,
    command: &str,
) -> Result<String, ExtractError> {
    let domain_owned = domain.to_string();
    let kind_owned = kind.to_string();
    let command_owned = command.to_string();

    if registry::get_session(domain).is_some() {
        let (d, k, c) = (domain_owned.clone(), kind_owned.clone(), command_owned.clone());
        let piggyback =
            tokio::task::spawn_blocking(move || piggyback_extract(&d, &c, &k)).await;
        match piggyback {
            Ok(Ok(config)) => return Ok(config),
            Ok(Err(err)) => {
                tracing::warn!(domain, error = %err, "piggyback extraction failed, falling back to virsh");
            }
            Err(err) => {
                tracing::warn!(domain, error = %err, "piggyback task panicked, falling back to virsh");
            }
        }
    }

    tokio::task::spawn_blocking(move || {
        direct_virsh_extract(&domain_owned, &command_owned, &kind_owned)
    })
    .await
    .map_err(|err| ExtractError::Other(err.to_string()))?
}

/// Domains whose post-boot commands already ran this start cycle.
fn vm_post_boot() -> &'static Mutex<HashSet<String>> {
    static CACHE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashSet::new()))
}

pub fn clear_vm_post_boot_cache(domain: &str) {
    vm_post_boot().lock().unwrap().remove(domain);
}

/// Run a batch of commands on an active web session's PTY, without
/// capturing or validating output. Used for post-boot seeding while a user
/// is watching the console.
pub fn piggyback_run_commands(
    domain: &str,
    commands: &[&str],
    kind: &str,
) -> Result<(), ExtractError> {
    let session = registry::get_session(domain)
        .ok_or_else(|| ExtractError::Busy(format!("no active console session for {domain}")))?;
    let vendor = vendor_config(kind);

    let _guard = session
        .session_mutex
        .try_lock()
        .map_err(|_| ExtractError::Busy(format!("session mutex busy for {domain}")))?;
    session.pause_flow();
    registry::set_console_control_state(domain, "read_only", "Applying configuration…");
    std::thread::sleep(Duration::from_millis(300));

    let ws_tx = session.ws_tx.clone();
    let mut injector = PtyInjector::with_forward(
        session.master_fd,
        Box::new(move |bytes| {
            let _ = ws_tx.send(WsFrame::Data(bytes.to_vec()));
        }),
    );

    let result = (|| -> Result<(), ExtractError> {
        let prompt = handle_login(&mut injector, vendor, Duration::from_secs(30))?;
        let prompts = prompt_patterns(vendor.prompt_pattern);
        let prompt_refs: Vec<&str> = prompts.iter().map(|s| s.as_str()).collect();
        if prompt.trim_end().ends_with('>') {
            let _ = enter_enable_mode(&mut injector, vendor, &prompts);
        }
        for command in commands {
            injector.sendline(command)?;
            let _ = injector.expect_any(&prompt_refs, Duration::from_secs(30))?;
        }
        Ok(())
    })();

    registry::set_console_control_state(domain, "interactive", "");
    registry::clear_console_control_state(domain);
    session.resume_flow();
    result
}

/// Run vendor post-boot commands over the console, once per start.
/// Piggybacks on an active web session when one exists; otherwise opens a
/// locked virsh session per command.
pub async fn run_vm_post_boot_commands(domain: &str, kind: &str) -> Result<(), ExtractError> {
    let vendor = vendor_config(kind);
    if vendor.post_boot_commands.is_empty() {
        return Ok(());
    }
    if vm_post_boot().lock().unwrap().contains(domain) {
        return Ok(());
    }

    if registry::get_session(domain).is_some() {
        let domain_owned = domain.to_string();
        let kind_owned = kind.to_string();
        let piggyback = tokio::task::spawn_blocking(move || {
            piggyback_run_commands(
                &domain_owned,
                vendor_config(&kind_owned).post_boot_commands,
                &kind_owned,
            )
        })
        .await
        .map_err(|err| ExtractError::Other(err.to_string()))?;
        match piggyback {
            Ok(()) => {
                vm_post_boot().lock().unwrap().insert(domain.to_string());
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(domain, error = %err, "piggyback post-boot failed, using virsh");
            }
        }
    }

    for command in vendor.post_boot_commands {
        let domain_owned = domain.to_string();
        let kind_owned = kind.to_string();
        let command_owned = command.to_string();
        let result = tokio::task::spawn_blocking(move || {
            run_console_command(&domain_owned, &command_owned, &kind_owned)
        })
        .await
        .map_err(|err| ExtractError::Other(err.to_string()))?;
        if let Err(err) = result {
            tracing::warn!(domain, command = %command, error = %err, "post-boot command failed");
        }
    }
    vm_post_boot().lock().unwrap().insert(domain.to_string());
    Ok(())
}

/// Run one command on the console without output validation.
fn run_console_command(domain: &str, command: &str, kind: &str) -> Result<(), ExtractError> {
    let cfg = settings();
    let _lock = lock::console_lock(
        domain,
        Duration::from_secs(cfg.console_lock_timeout_secs),
        true,
    )
    .map_err(|err| ExtractError::Busy(err.to_string()))?;

    let (master, child) = spawn_virsh_console(domain).map_err(ExtractError::Other)?;
    let vendor = vendor_config(kind);
    let mut injector = PtyInjector::new(master.as_raw_fd());

    let result = (|| -> Result<(), ExtractError> {
        let prompt = handle_login(&mut injector, vendor, Duration::from_secs(30))?;
        let prompts = prompt_patterns(vendor.prompt_pattern);
        let prompt_refs: Vec<&str> = prompts.iter().map(|s| s.as_str()).collect();
        if prompt.trim_end().ends_with('>') {
            let _ = enter_enable_mode(&mut injector, vendor, &prompts);
        }
        injector.sendline(command)?;
        let _ = injector.expect_any(&prompt_refs, Duration::from_secs(30))?;
        Ok(())
    })();

    cleanup_virsh_child(child);
    drop(master);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_policy_requires_all_classes() {
        assert!(is_strong_admin_password("Archetype123!"));
        assert!(!is_strong_admin_password("short1!A"));
        assert!(is_strong_admin_password("short1!Ab"));
        assert!(!is_strong_admin_password("alllowercase1!"));
        assert!(!is_strong_admin_password("ALLUPPERCASE1!"));
        assert!(!is_strong_admin_password("NoDigitsHere!"));
        assert!(!is_strong_admin_password("NoSymbols123"));
    }

    #[test]
    fn weak_configured_password_falls_back_to_default() {
        assert_eq!(bootstrap_admin_password("admin"), "Archetype123!");
        assert_eq!(bootstrap_admin_password(""), "Archetype123!");
        assert_eq!(bootstrap_admin_password("MyStr0ng!Pass"), "MyStr0ng!Pass");
    }

    #[test]
    fn prompt_chain_has_vendor_then_fallbacks() {
        let chain = prompt_patterns(r"switch[>#]$");
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0], "switch[>#]$");
        // The Cisco-mode fallback is not duplicated when it IS the vendor
        // pattern.
        let chain = prompt_patterns(CISCO_MODE_PROMPT);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn clean_config_strips_noise() {
        let raw = "\u{1b}[2Jswitch# show running-config\r\nBuilding configuration...\r\n\r\nversion 9.3\r\nhostname n9k1\r\n!\r\nswitch# \r\n";
        let cleaned = clean_config(raw, "show running-config");
        assert!(cleaned.contains("version 9.3"));
        assert!(cleaned.contains("hostname n9k1"));
        assert!(!cleaned.contains("Building configuration"));
        assert!(!cleaned.contains("show running-config"));
        assert!(!cleaned.contains("switch#"));
        assert!(!cleaned.contains('\u{1b}'));
    }

    #[test]
    fn clean_config_drops_virsh_banners() {
        let raw = "Connected to domain arch-lab1-n9k1\nEscape character is ^]\nhostname x\n!\nend\n";
        let cleaned = clean_config(raw, "show running-config");
        assert!(!cleaned.contains("Connected to domain"));
        assert!(!cleaned.contains("Escape character"));
        assert!(cleaned.starts_with("hostname x"));
    }

    #[test]
    fn validation_accepts_real_config() {
        let config = "version 9.3\nhostname n9k1\ninterface Ethernet1/1\n no shutdown\n!";
        assert!(validate_extracted_config(config, "show running-config", "terminal length 0").is_ok());
    }

    #[test]
    fn validation_rejects_cli_errors() {
        let config = "version 9.3\nhostname n9k1\n% Invalid input detected at '^' marker";
        let err = validate_extracted_config(config, "show running-config", "").unwrap_err();
        assert!(err.contains("% invalid input"));
    }

    #[test]
    fn validation_rejects_empty_and_echo_only() {
        assert!(validate_extracted_config("", "show run", "").is_err());
        let echo_only = "switch# show run\nswitch# terminal length 0";
        assert!(validate_extracted_config(echo_only, "show run", "terminal length 0").is_err());
    }

    #[test]
    fn validation_rejects_short_markerless_output() {
        assert!(validate_extracted_config("a\nb", "show run", "").is_err());
    }

    #[test]
    fn retryable_classification() {
        assert!(is_retryable(&ExtractError::Busy("x".into())));
        assert!(is_retryable(&ExtractError::Timeout("x".into())));
        assert!(!is_retryable(&ExtractError::Cli("x".into())));
        assert!(!is_retryable(&ExtractError::Invalid("x".into())));
    }

    /// Drive the full sequence against a scripted fake device on a PTY
    /// pair: the test side plays the device, the injector side extracts.
    #[test]
    fn drive_extraction_against_scripted_device() {
        use std::io::{Read, Write};
        use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};

        let (master, device_end) = {
            let result = nix::pty::openpty(None, None).unwrap();
            (result.master, result.slave)
        };
        let device_fd = device_end.into_raw_fd();
        let mut device = unsafe { std::fs::File::from_raw_fd(device_fd) };

        let scripted = std::thread::spawn(move || {
            let mut buf = [0u8; 256];
            let send = |device: &mut std::fs::File, text: &str| {
                device.write_all(text.as_bytes()).unwrap();
                device.flush().unwrap();
            };
            // Wake newline
            let _ = device.read(&mut buf).unwrap();
            send(&mut device, "switch login: ");
            let _ = device.read(&mut buf).unwrap(); // username
            send(&mut device, "Password: ");
            let _ = device.read(&mut buf).unwrap(); // password
            send(&mut device, "\r\nswitch# ");
            let _ = device.read(&mut buf).unwrap(); // terminal length 0
            send(&mut device, "terminal length 0\r\nswitch# ");
            let _ = device.read(&mut buf).unwrap(); // show running-config
            send(&mut device, "show running-config\r\nversion 9.3\r\nhostname scripted\r\ninterface Ethernet1/1\r\n!\r\nswitch# ");
        });

        let vendor = crate::vendors::vendor_config("cisco_n9kv");
        let mut injector = PtyInjector::new(master.as_raw_fd());
        let options = DriveOptions {
            command: "show running-config".into(),
            timeout: Duration::from_secs(10),
        };
        let config = drive_extraction(&mut injector, vendor, &options).unwrap();
        scripted.join().unwrap();

        assert!(config.contains("hostname scripted"));
        assert!(config.contains("interface Ethernet1/1"));
        assert!(!config.contains("switch#"));
    }

    /// End-to-end piggyback: a registered web session's PTY is borrowed,
    /// the browser sees read-only/interactive control frames plus the
    /// echoed automation, and the flow gates are re-enabled at return.
    #[test]
    fn piggyback_extract_drives_session_and_restores_flow() {
        use std::io::{Read, Write};
        use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};

        let (master, device_end) = {
            let result = nix::pty::openpty(None, None).unwrap();
            (result.master, result.slave)
        };
        let mut device = unsafe { std::fs::File::from_raw_fd(device_end.into_raw_fd()) };

        let scripted = std::thread::spawn(move || {
            let mut buf = [0u8; 256];
            let send = |device: &mut std::fs::File, text: &str| {
                device.write_all(text.as_bytes()).unwrap();
                device.flush().unwrap();
            };
            let _ = device.read(&mut buf).unwrap(); // wake
            send(&mut device, "n9k1 login: ");
            let _ = device.read(&mut buf).unwrap(); // username
            send(&mut device, "Password: ");
            let _ = device.read(&mut buf).unwrap(); // password
            send(&mut device, "\r\nn9k1# ");
            let _ = device.read(&mut buf).unwrap(); // terminal length 0
            send(&mut device, "n9k1# ");
            let _ = device.read(&mut buf).unwrap(); // show running-config
            send(&mut device, "version 9.3\r\nhostname piggy\r\ninterface mgmt0\r\n!\r\nn9k1# ");
        });

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let session =
            registry::ActiveConsoleSession::new("pb-domain", master.as_raw_fd(), tx);
        let gates = (session.input_enabled.clone(), session.pty_read_enabled.clone());
        registry::register_session(session);

        let config = piggyback_extract("pb-domain", "show running-config", "cisco_n9kv").unwrap();
        scripted.join().unwrap();
        registry::unregister_session("pb-domain");

        assert!(config.contains("hostname piggy"));

        // Flow gates are set (enabled) again at return.
        assert!(gates.0.load(std::sync::atomic::Ordering::SeqCst));
        assert!(gates.1.load(std::sync::atomic::Ordering::SeqCst));

        // The browser saw: read-only banner, echoed automation bytes, then
        // the interactive restore.
        let mut controls = Vec::new();
        let mut saw_data = false;
        while let Ok(frame) = rx.try_recv() {
            match frame {
                WsFrame::Control(body) => controls.push(body),
                WsFrame::Data(_) => saw_data = true,
            }
        }
        assert!(saw_data, "automation output was not forwarded to the session");
        assert!(controls.iter().any(|c| c.contains("read_only")));
        assert!(controls.iter().any(|c| c.contains("interactive")));
        let ro = controls.iter().position(|c| c.contains("read_only")).unwrap();
        let ia = controls.iter().position(|c| c.contains("interactive")).unwrap();
        assert!(ro < ia, "read_only must precede interactive");
    }

    /// Extraction with no registered session reports busy (the caller then
    /// falls back to a direct virsh session).
    #[test]
    fn piggyback_without_session_is_busy() {
        let err = piggyback_extract("pb-none", "show running-config", "cisco_n9kv").unwrap_err();
        assert!(matches!(err, ExtractError::Busy(_)));
        assert!(is_retryable(&err));
    }

    /// A device stuck in user EXEC mode must fail config extraction.
    #[test]
    fn user_exec_mode_fails_running_config() {
        use std::io::{Read, Write};
        use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};

        let (master, device_end) = {
            let result = nix::pty::openpty(None, None).unwrap();
            (result.master, result.slave)
        };
        let mut device = unsafe { std::fs::File::from_raw_fd(device_end.into_raw_fd()) };

        let scripted = std::thread::spawn(move || {
            let mut buf = [0u8; 256];
            let send = |device: &mut std::fs::File, text: &str| {
                device.write_all(text.as_bytes()).unwrap();
                device.flush().unwrap();
            };
            let _ = device.read(&mut buf).unwrap(); // wake newline
            send(&mut device, "switch> ");
            let _ = device.read(&mut buf).unwrap(); // enable
            send(&mut device, "enable\r\n% Invalid input\r\nswitch> ");
        });

        let vendor = crate::vendors::vendor_config("cisco_n9kv");
        let mut injector = PtyInjector::new(master.as_raw_fd());
        let options = DriveOptions {
            command: "show running-config".into(),
            timeout: Duration::from_secs(10),
        };
        let err = drive_extraction(&mut injector, vendor, &options).unwrap_err();
        scripted.join().unwrap();
        assert!(matches!(err, ExtractError::ExecMode(_)));
        assert!(err.to_string().contains("Device remained in user EXEC mode"));
    }
}
