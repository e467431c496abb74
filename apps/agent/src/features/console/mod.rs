//! Console endpoints: the web PTY WebSocket, config extraction, readiness,
//! and the POAP bootstrap files.

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use archetype_types::{ExtractConfigRequest, ExtractConfigResponse, ReadinessStatus};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::config::settings;
use crate::console::{extractor, lock, registry};
use crate::providers::docker::DockerProvider;
use crate::providers::libvirt::{poap, LibvirtProvider};
use crate::providers::Provider;
use crate::vendors::{vendor_config, ExtractMethod};

use super::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/labs/:lab/nodes/:node/console/ws", get(ws_console))
        .route("/labs/:lab/nodes/:node/console-command", get(console_command))
        .route("/labs/:lab/nodes/:node/extract-config", post(extract_config))
        .route("/labs/:lab/nodes/:node/readiness", get(readiness))
        .route("/poap/:lab/:node/script.py", get(poap_script))
        .route("/poap/:lab/:node/startup-config", get(poap_startup_config))
}

#[derive(Debug, Deserialize)]
struct KindQuery {
    #[serde(default)]
    kind: Option<String>,
}

async fn console_command(
    Extension(st): Extension<AppState>,
    Path((lab, node)): Path<(String, String)>,
) -> Json<serde_json::Value> {
    match st.docker.get_console_command(&lab, &node).await {
        Ok(command) => Json(serde_json::json!({ "success": true, "command": command })),
        Err(_) => match st.libvirt.get_console_command(&lab, &node).await {
            Ok(command) => Json(serde_json::json!({ "success": true, "command": command })),
            Err(err) => Json(serde_json::json!({ "success": false, "error": err.to_string() })),
        },
    }
}

async fn readiness(
    Extension(st): Extension<AppState>,
    Path((lab, node)): Path<(String, String)>,
    Query(query): Query<KindQuery>,
) -> Json<ReadinessStatus> {
    let kind = query.kind.unwrap_or_else(|| "linux".to_string());
    let vendor = vendor_config(&kind);
    let result = if vendor.extract_method == ExtractMethod::Serial || vendor.efi_boot {
        st.libvirt.check_readiness(&lab, &node, &kind).await
    } else {
        st.docker.check_readiness(&lab, &node, &kind).await
    };
    Json(result.unwrap_or(ReadinessStatus {
        is_ready: false,
        message: "probe error".into(),
        progress_percent: None,
    }))
}

async fn extract_config(
    Extension(st): Extension<AppState>,
    Path((lab, node)): Path<(String, String)>,
    Query(query): Query<KindQuery>,
    Json(req): Json<ExtractConfigRequest>,
) -> Json<ExtractConfigResponse> {
    let kind = query.kind.unwrap_or_else(|| "linux".to_string());
    let vendor = vendor_config(&kind);
    let command = req
        .command
        .unwrap_or_else(|| vendor.config_command.to_string());

    let result = if vendor.extract_method == ExtractMethod::Serial {
        let domain = LibvirtProvider::domain_name(&lab, &node);
        match extractor::extract_vm_config(&domain, &kind, &command).await {
            Ok(config) => {
                // Persist beside container-extracted configs so redeploys
                // pick it up.
                let workspace = std::path::Path::new(&settings().workspace_path);
                if let Err(err) =
                    crate::providers::docker::extract::save_config(workspace, &lab, &node, &config)
                {
                    tracing::warn!(lab, node, error = %err, "failed to save extracted config");
                }
                Ok(config)
            }
            Err(err) => Err(err.to_string()),
        }
    } else {
        st.docker
            .extract_config(&lab, &node, &kind)
            .await
            .map_err(|err| err.to_string())
    };

    Json(match result {
        Ok(config) => ExtractConfigResponse {
            success: true,
            config: Some(config),
            error: None,
        },
        Err(error) => ExtractConfigResponse {
            success: false,
            config: None,
            error: Some(error),
        },
    })
}

// ---------------------------------------------------------------------
// POAP bootstrap
// ---------------------------------------------------------------------

fn workspace_startup_config(lab: &str, node: &str) -> std::path::PathBuf {
    std::path::Path::new(&settings().workspace_path)
        .join(lab)
        .join("configs")
        .join(node)
        .join("startup-config")
}

async fn poap_script(Path((lab, node)): Path<(String, String)>) -> Response {
    if !workspace_startup_config(&lab, &node).exists() {
        return (StatusCode::NOT_FOUND, "no startup config for node").into_response();
    }
    let cfg = settings();
    let host = if cfg.local_ip.is_empty() {
        crate::core::iproute::detect_local_ip().await
    } else {
        cfg.local_ip.clone()
    };
    let config_url = format!(
        "http://{host}:{}/poap/{lab}/{node}/startup-config",
        cfg.agent_port
    );
    poap::poap_script(&config_url).into_response()
}

async fn poap_startup_config(Path((lab, node)): Path<(String, String)>) -> Response {
    match tokio::fs::read_to_string(workspace_startup_config(&lab, &node)).await {
        Ok(body) => body.into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "no startup config for node").into_response(),
    }
}

// ---------------------------------------------------------------------
// Web console session
// ---------------------------------------------------------------------

async fn ws_console(
    ws: WebSocketUpgrade,
    Path((lab, node)): Path<(String, String)>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = run_console_session(&lab, &node, socket).await {
            tracing::warn!(lab, node, error = %err, "console session ended with error");
        }
    })
}

/// One user console session bridged to the WebSocket with pausable
/// reader/writer so extraction can piggyback.
///
/// Container nodes get `docker exec -it` under a PTY; VM nodes get `virsh
/// console --force` under the per-domain lock (docker exec sessions do not
/// contend for a serial line, so they skip the lock).
async fn run_console_session(lab: &str, node: &str, socket: WebSocket) -> anyhow::Result<()> {
    let container = DockerProvider::container_name(lab, node);
    let is_container = match crate::core::docker::connect() {
        Ok(docker) => crate::core::docker::container_exists(&docker, &container).await,
        Err(_) => false,
    };

    let mut _guard = None;
    let (domain, spawned) = if is_container {
        let shell = match crate::core::docker::connect() {
            Ok(docker) => docker
                .inspect_container(&container, None)
                .await
                .ok()
                .and_then(|inspect| inspect.config)
                .and_then(|config| config.labels)
                .and_then(|labels| {
                    labels
                        .get(crate::providers::docker::LABEL_NODE_KIND)
                        .map(|kind| crate::vendors::is_ceos_kind(kind))
                })
                .map(|ceos| if ceos { "Cli" } else { "sh" })
                .unwrap_or("sh"),
            Err(_) => "sh",
        };
        (
            container.clone(),
            extractor::spawn_docker_exec_console(&container, shell),
        )
    } else {
        let domain = LibvirtProvider::domain_name(lab, node);
        let guard = {
            let domain = domain.clone();
            tokio::task::spawn_blocking(move || {
                lock::console_lock(&domain, Duration::from_secs(5), true)
            })
            .await?
        };
        match guard {
            Ok(guard) => _guard = Some(guard),
            Err(err) => {
                let (mut tx, _) = socket.split();
                let _ = tx
                    .send(Message::Text(registry::control_frame(
                        "error",
                        &err.to_string(),
                    )))
                    .await;
                return Ok(());
            }
        }
        let spawned = extractor::spawn_virsh_console(&domain);
        (domain, spawned)
    };

    let (master, child) =
        spawned.map_err(|err| anyhow::anyhow!("console spawn failed: {err}"))?;
    let master_fd = master.as_raw_fd();

    let (frame_tx, mut frame_rx) = tokio::sync::mpsc::unbounded_channel();
    let session = registry::ActiveConsoleSession::new(&domain, master_fd, frame_tx.clone());
    let input_enabled = session.input_enabled.clone();
    let pty_read_enabled = session.pty_read_enabled.clone();
    registry::register_session(session);

    let done = Arc::new(AtomicBool::new(false));

    // PTY -> WS reader on a blocking thread; honors the read flow gate so
    // piggyback extraction can take the fd.
    let reader_done = done.clone();
    let reader_tx = frame_tx.clone();
    let reader = std::thread::spawn(move || {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
        use std::os::fd::BorrowedFd;
        let mut buf = [0u8; 4096];
        while !reader_done.load(Ordering::SeqCst) {
            if !pty_read_enabled.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            let borrowed = unsafe { BorrowedFd::borrow_raw(master_fd) };
            let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(200u16)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(_) => break,
            }
            // Re-check the gate: extraction may have claimed the fd while
            // we were polling.
            if !pty_read_enabled.load(Ordering::SeqCst) {
                continue;
            }
            match nix::unistd::read(master_fd, &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if reader_tx.send(registry::WsFrame::Data(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let (mut ws_tx, mut ws_rx) = socket.split();

    let sender = async {
        while let Some(frame) = frame_rx.recv().await {
            let message = match frame {
                registry::WsFrame::Data(bytes) => Message::Binary(bytes),
                registry::WsFrame::Control(body) => Message::Text(body),
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    };

    let receiver = async {
        while let Some(message) = ws_rx.next().await {
            let Ok(message) = message else { break };
            if input_enabled.load(Ordering::SeqCst) {
                let bytes = match &message {
                    Message::Text(text) => text.as_bytes().to_vec(),
                    Message::Binary(bytes) => bytes.clone(),
                    Message::Close(_) => break,
                    _ => continue,
                };
                let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(master_fd) };
                let _ = nix::unistd::write(borrowed, &bytes);
            }
        }
    };

    tokio::select! {
        _ = sender => {}
        _ = receiver => {}
    }

    done.store(true, Ordering::SeqCst);
    registry::unregister_session(&domain);
    extractor::cleanup_virsh_child(child);
    drop(master);
    let _ = tokio::task::spawn_blocking(move || {
        let _ = reader.join();
    })
    .await;
    tracing::info!(domain, "console session closed");
    Ok(())
}
