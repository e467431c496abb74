//! Active web console sessions and the console-control state map.
//!
//! One session per domain. Extraction piggybacks on a registered session's
//! PTY instead of opening a second virsh console; the flow gates pause the
//! session's reader/writer tasks while automation owns the fd.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::mpsc::UnboundedSender;

/// Frames the WebSocket task sends to the browser.
#[derive(Debug, Clone)]
pub enum WsFrame {
    /// Raw console bytes.
    Data(Vec<u8>),
    /// A `console-control` JSON frame.
    Control(String),
}

#[derive(Clone)]
pub struct ActiveConsoleSession {
    pub domain: String,
    /// PTY master fd owned by the session's virsh child.
    pub master_fd: RawFd,
    pub ws_tx: UnboundedSender<WsFrame>,
    /// Cleared to pause user keystrokes into the PTY.
    pub input_enabled: Arc<AtomicBool>,
    /// Cleared to pause the PTY->WS reader.
    pub pty_read_enabled: Arc<AtomicBool>,
    /// Serializes piggyback automation against session teardown.
    pub session_mutex: Arc<Mutex<()>>,
}

impl ActiveConsoleSession {
    pub fn new(domain: &str, master_fd: RawFd, ws_tx: UnboundedSender<WsFrame>) -> Self {
        Self {
            domain: domain.to_string(),
            master_fd,
            ws_tx,
            input_enabled: Arc::new(AtomicBool::new(true)),
            pty_read_enabled: Arc::new(AtomicBool::new(true)),
            session_mutex: Arc::new(Mutex::new(())),
        }
    }

    pub fn pause_flow(&self) {
        self.input_enabled.store(false, Ordering::SeqCst);
        self.pty_read_enabled.store(false, Ordering::SeqCst);
    }

    pub fn resume_flow(&self) {
        self.input_enabled.store(true, Ordering::SeqCst);
        self.pty_read_enabled.store(true, Ordering::SeqCst);
    }

    pub fn input_paused(&self) -> bool {
        !self.input_enabled.load(Ordering::SeqCst)
    }

    pub fn pty_read_paused(&self) -> bool {
        !self.pty_read_enabled.load(Ordering::SeqCst)
    }
}

fn sessions() -> &'static Mutex<HashMap<String, ActiveConsoleSession>> {
    static SESSIONS: OnceLock<Mutex<HashMap<String, ActiveConsoleSession>>> = OnceLock::new();
    SESSIONS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// domain -> (state, message). Survives the session so a page reload during
/// extraction still shows the read-only banner.
fn control_states() -> &'static Mutex<HashMap<String, (String, String)>> {
    static STATES: OnceLock<Mutex<HashMap<String, (String, String)>>> = OnceLock::new();
    STATES.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn register_session(session: ActiveConsoleSession) {
    let domain = session.domain.clone();
    // Replay persisted read-only state to the fresh WebSocket.
    if let Some((state, message)) = get_console_control_state(&domain) {
        if state == "read_only" {
            let _ = session
                .ws_tx
                .send(WsFrame::Control(control_frame(&state, &message)));
        }
    }
    sessions().lock().unwrap().insert(domain, session);
}

pub fn unregister_session(domain: &str) {
    sessions().lock().unwrap().remove(domain);
}

pub fn get_session(domain: &str) -> Option<ActiveConsoleSession> {
    sessions().lock().unwrap().get(domain).cloned()
}

pub fn list_active_domains() -> Vec<String> {
    sessions().lock().unwrap().keys().cloned().collect()
}

pub fn control_frame(state: &str, message: &str) -> String {
    serde_json::json!({
        "type": "console-control",
        "state": state,
        "message": message,
    })
    .to_string()
}

/// Persist the control state and push it to the live session, if any.
pub fn set_console_control_state(domain: &str, state: &str, message: &str) {
    control_states()
        .lock()
        .unwrap()
        .insert(domain.to_string(), (state.to_string(), message.to_string()));
    if let Some(session) = get_session(domain) {
        let _ = session
            .ws_tx
            .send(WsFrame::Control(control_frame(state, message)));
    }
}

pub fn get_console_control_state(domain: &str) -> Option<(String, String)> {
    control_states().lock().unwrap().get(domain).cloned()
}

pub fn clear_console_control_state(domain: &str) {
    control_states().lock().unwrap().remove(domain);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_get_unregister_round_trip() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let session = ActiveConsoleSession::new("reg-dom-1", 0, tx);
        register_session(session);
        assert!(get_session("reg-dom-1").is_some());
        assert!(list_active_domains().contains(&"reg-dom-1".to_string()));
        unregister_session("reg-dom-1");
        assert!(get_session("reg-dom-1").is_none());
    }

    #[test]
    fn flow_gates_toggle_together() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let session = ActiveConsoleSession::new("reg-dom-2", 0, tx);
        assert!(!session.input_paused());
        session.pause_flow();
        assert!(session.input_paused());
        assert!(session.pty_read_paused());
        session.resume_flow();
        assert!(!session.pty_read_paused());
    }

    #[test]
    fn read_only_state_replays_on_register() {
        set_console_control_state("reg-dom-3", "read_only", "Configuration in progress…");
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        register_session(ActiveConsoleSession::new("reg-dom-3", 0, tx));

        let frame = rx.try_recv().expect("control frame replayed");
        match frame {
            WsFrame::Control(body) => {
                assert!(body.contains("read_only"));
                assert!(body.contains("Configuration in progress"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
        unregister_session("reg-dom-3");
        clear_console_control_state("reg-dom-3");
    }

    #[test]
    fn control_state_pushes_to_live_session() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        register_session(ActiveConsoleSession::new("reg-dom-4", 0, tx));
        set_console_control_state("reg-dom-4", "interactive", "");
        let frame = rx.try_recv().expect("control frame pushed");
        assert!(matches!(frame, WsFrame::Control(body) if body.contains("interactive")));
        unregister_session("reg-dom-4");
        clear_console_control_state("reg-dom-4");
    }
}
