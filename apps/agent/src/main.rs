mod config;
mod console;
mod core;
mod features;
mod heartbeat;
mod plugin;
mod providers;
mod vendors;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::settings;
use crate::features::AppState;
use crate::plugin::OvsPlugin;
use crate::providers::docker::DockerProvider;
use crate::providers::libvirt::LibvirtProvider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("warn,agent=info")
            .add_directive("hyper_util=warn".parse().unwrap())
            .add_directive("bollard=warn".parse().unwrap())
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = settings();
    let plugin = Arc::new(OvsPlugin::new());

    // Converge with OVS and Docker before taking traffic; attachment repair
    // and orphan cleanup run after the listeners are up.
    let report = match plugin.reconcile_on_startup().await {
        Ok(report) => report,
        Err(err) => {
            warn!(error = %err, "startup reconciliation failed, starting with empty state");
            plugin::reconcile::ReconcileReport::default()
        }
    };

    if cfg.enable_ovs_plugin {
        let _plugin_handle = plugin::spawn(plugin.clone());
    }
    let _ttl_handle = plugin::reconcile::spawn_ttl_cleaner(plugin.clone());

    let docker = Arc::new(DockerProvider::new(plugin.clone())?);
    let libvirt = Arc::new(LibvirtProvider::new(plugin.clone()));
    let state = AppState {
        plugin: plugin.clone(),
        docker,
        libvirt,
    };

    let _heartbeat_handle = heartbeat::spawn();

    {
        let plugin = plugin.clone();
        tokio::spawn(async move {
            // Give Docker a moment to notice the plugin socket.
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            plugin.post_start_reconcile(report).await;
        });
    }

    let app = features::router(state);
    let bind = format!("{}:{}", cfg.agent_host, cfg.agent_port);
    info!(%bind, agent_id = %cfg.agent_id, "agent listening");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
