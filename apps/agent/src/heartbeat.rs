//! Controller registration and the heartbeat loop.
//!
//! Registration failures are transient by definition: the agent keeps
//! serving its API and retries on the next tick, and the controller treats
//! a missed heartbeat as agent-unavailable rather than an error state.

use std::time::Duration;

use archetype_types::{HeartbeatRequest, RegisterAgentRequest};
use tokio::time::{interval, MissedTickBehavior};

use crate::config::settings;

fn client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .expect("reqwest client")
}

fn with_auth(builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    let secret = &settings().controller_secret;
    if secret.is_empty() {
        builder
    } else {
        builder.bearer_auth(secret)
    }
}

async fn register_once() -> anyhow::Result<()> {
    let cfg = settings();
    let providers = {
        let mut providers = Vec::new();
        if cfg.enable_docker {
            providers.push("docker".to_string());
        }
        if cfg.enable_libvirt {
            providers.push("libvirt".to_string());
        }
        providers
    };
    let address = format!("http://{}:{}", cfg.local_ip_or_detect().await, cfg.agent_port);
    let body = RegisterAgentRequest {
        agent_id: cfg.agent_id.clone(),
        name: cfg.agent_name.clone(),
        address,
        providers,
    };
    let url = format!("{}/api/agents/register", cfg.controller_url.trim_end_matches('/'));
    with_auth(client(cfg.registration_timeout_secs).post(&url).json(&body))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

async fn heartbeat_once() -> anyhow::Result<()> {
    let cfg = settings();
    let body = HeartbeatRequest {
        agent_id: cfg.agent_id.clone(),
        timestamp: chrono::Utc::now(),
    };
    let url = format!("{}/api/agents/heartbeat", cfg.controller_url.trim_end_matches('/'));
    with_auth(client(cfg.heartbeat_timeout_secs).post(&url).json(&body))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

impl crate::config::Settings {
    pub async fn local_ip_or_detect(&self) -> String {
        if self.local_ip.is_empty() {
            crate::core::iproute::detect_local_ip().await
        } else {
            self.local_ip.clone()
        }
    }
}

pub fn spawn() -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut registered = false;
        let mut ticker = interval(Duration::from_secs(settings().heartbeat_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if !registered {
                match register_once().await {
                    Ok(()) => {
                        tracing::info!("registered with controller");
                        registered = true;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "controller registration failed, will retry");
                    }
                }
            } else if let Err(err) = heartbeat_once().await {
                tracing::warn!(error = %err, "heartbeat failed");
                metrics::counter!("agent_heartbeat_failure", 1);
                // Controller may have restarted and lost us; re-register.
                registered = false;
            }
            ticker.tick().await;
        }
    })
}
