//! Per-domain locking for virsh console access.
//!
//! Three code paths compete for a VM's single serial console: the readiness
//! probe (brief reads), config extraction (long pexpect-style sessions) and
//! the web console (persistent user PTY). Concurrent `virsh console --force`
//! calls produce "stream had I/O failure"; this module serializes access
//! with a blocking per-domain lock plus orphan process cleanup.
//!
//! Locks are std primitives, not tokio ones: readiness and extraction run on
//! blocking worker threads.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use thiserror::Error;

struct DomainLock {
    busy: Mutex<bool>,
    cv: Condvar,
}

fn locks() -> &'static Mutex<HashMap<String, Arc<DomainLock>>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<DomainLock>>>> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn active_extractions() -> &'static Mutex<HashSet<String>> {
    static ACTIVE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

fn get_lock(domain: &str) -> Arc<DomainLock> {
    let mut map = locks().lock().unwrap();
    map.entry(domain.to_string())
        .or_insert_with(|| {
            Arc::new(DomainLock {
                busy: Mutex::new(false),
                cv: Condvar::new(),
            })
        })
        .clone()
}

#[derive(Debug, Error)]
#[error("could not acquire console lock for {domain} within {timeout:?} (another session is active)")]
pub struct LockTimeout {
    pub domain: String,
    pub timeout: Duration,
}

/// Held while a consumer owns the domain's console.
pub struct ConsoleLockGuard {
    lock: Arc<DomainLock>,
}

impl Drop for ConsoleLockGuard {
    fn drop(&mut self) {
        let mut busy = self.lock.busy.lock().unwrap();
        *busy = false;
        self.lock.cv.notify_one();
    }
}

/// Blocking acquisition with timeout. Kills orphaned virsh console
/// processes first when asked — a prior extraction that died with the lock
/// held leaves a virsh process wedging the PTY.
pub fn console_lock(
    domain: &str,
    timeout: Duration,
    kill_orphans: bool,
) -> Result<ConsoleLockGuard, LockTimeout> {
    if kill_orphans {
        kill_orphaned_virsh(domain);
    }
    let lock = get_lock(domain);
    let busy = lock.busy.lock().unwrap();
    let (mut busy, wait) = lock
        .cv
        .wait_timeout_while(busy, timeout, |busy| *busy)
        .unwrap();
    if wait.timed_out() && *busy {
        return Err(LockTimeout {
            domain: domain.to_string(),
            timeout,
        });
    }
    *busy = true;
    drop(busy);
    Ok(ConsoleLockGuard { lock })
}

/// Non-blocking attempt. Returns None while extraction owns the domain or
/// another consumer holds the lock; readiness probes skip the cycle.
pub fn try_console_lock(domain: &str) -> Option<ConsoleLockGuard> {
    if is_extraction_active(domain) {
        return None;
    }
    let lock = get_lock(domain);
    let mut busy = lock.busy.lock().unwrap();
    if *busy {
        return None;
    }
    *busy = true;
    drop(busy);
    Some(ConsoleLockGuard { lock })
}

pub fn is_extraction_active(domain: &str) -> bool {
    active_extractions().lock().unwrap().contains(domain)
}

/// Marks a domain as actively extracting so probes back off instead of
/// contending.
pub struct ExtractionSession {
    domain: String,
}

impl ExtractionSession {
    pub fn begin(domain: &str) -> Self {
        active_extractions()
            .lock()
            .unwrap()
            .insert(domain.to_string());
        Self {
            domain: domain.to_string(),
        }
    }
}

impl Drop for ExtractionSession {
    fn drop(&mut self) {
        active_extractions().lock().unwrap().remove(&self.domain);
    }
}

/// Kill orphaned `virsh console` processes for a domain: SIGTERM, then
/// SIGKILL for survivors. Returns the number of processes signalled.
pub fn kill_orphaned_virsh(domain: &str) -> usize {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pattern = format!("virsh.*console.*{domain}");
    let output = std::process::Command::new("pgrep")
        .args(["-f", &pattern])
        .output();
    let Ok(output) = output else {
        return 0;
    };
    if !output.status.success() {
        return 0;
    }

    let my_pid = std::process::id();
    let mut killed = 0;
    let mut victims = Vec::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let Ok(pid) = line.trim().parse::<i32>() else {
            continue;
        };
        if pid as u32 == my_pid {
            continue;
        }
        if kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok() {
            tracing::info!(pid, domain, "killed orphaned virsh console process");
            victims.push(pid);
            killed += 1;
        }
    }
    if !victims.is_empty() {
        std::thread::sleep(Duration::from_millis(500));
        for pid in victims {
            // Still alive after SIGTERM -> SIGKILL. ESRCH means it exited.
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
    killed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_per_domain() {
        let guard = try_console_lock("test-dom-a").expect("first acquire");
        assert!(try_console_lock("test-dom-a").is_none());
        // A different domain is unaffected.
        assert!(try_console_lock("test-dom-b").is_some());
        drop(guard);
        assert!(try_console_lock("test-dom-a").is_some());
    }

    #[test]
    fn blocking_acquire_times_out() {
        let _guard = try_console_lock("test-dom-c").expect("acquire");
        let err = console_lock("test-dom-c", Duration::from_millis(50), false)
            .err()
            .expect("should time out");
        assert_eq!(err.domain, "test-dom-c");
    }

    #[test]
    fn blocking_acquire_succeeds_when_released() {
        let guard = try_console_lock("test-dom-d").expect("acquire");
        let handle = std::thread::spawn(|| {
            console_lock("test-dom-d", Duration::from_secs(5), false).is_ok()
        });
        std::thread::sleep(Duration::from_millis(50));
        drop(guard);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn extraction_session_blocks_try_lock() {
        {
            let _session = ExtractionSession::begin("test-dom-e");
            assert!(is_extraction_active("test-dom-e"));
            assert!(try_console_lock("test-dom-e").is_none());
        }
        assert!(!is_extraction_active("test-dom-e"));
        assert!(try_console_lock("test-dom-e").is_some());
    }
}
