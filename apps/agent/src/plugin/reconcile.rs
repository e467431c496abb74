//! Startup reconciliation: converge in-memory state with OVS reality and
//! with what Docker believes, then keep lab bridges from outliving their
//! labs via the TTL cleaner.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::settings;
use crate::core::{docker, iproute, ovs};

use super::OvsPlugin;

/// Legacy per-lab bridges used this prefix before the shared-bridge design.
const LEGACY_BRIDGE_PREFIX: &str = "ovs-";

impl OvsPlugin {
    /// Phase 1+2+3 of startup reconciliation, run before the HTTP listener
    /// is up: load state, verify the bridge, sort endpoints into live /
    /// reconnect-queued / dropped.
    pub async fn reconcile_on_startup(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let loaded = self.load_state().await;
        if !loaded {
            // Nothing persisted: just make sure the shared bridge exists.
            // Lab state is rediscovered as Docker reissues driver calls.
            ovs::ensure_bridge(&self.bridge_name).await?;
            self.migrate_legacy_bridges().await?;
            return Ok(report);
        }

        let needs_bridge = {
            let inner = self.inner.lock().await;
            !inner.tables.networks.is_empty() || !inner.tables.lab_bridges.is_empty()
        };
        if needs_bridge && !ovs::bridge_exists(&self.bridge_name).await {
            tracing::warn!(bridge = %self.bridge_name, "shared bridge missing, recreating");
            ovs::ensure_bridge(&self.bridge_name).await?;
            report.bridge_recreated = true;
        }

        // Classify endpoints by whether their host veth still exists.
        let mut inner = self.inner.lock().await;
        let mut dropped = Vec::new();
        for (endpoint_id, ep) in inner.tables.endpoints.iter() {
            if iproute::link_exists_sys(&ep.host_veth) {
                continue;
            }
            if let Some(container) = &ep.container_name {
                report
                    .reconnect_queue
                    .push((container.clone(), ep.network_id.clone()));
            } else {
                dropped.push(endpoint_id.clone());
            }
        }
        for endpoint_id in &dropped {
            if let Some(ep) = inner.tables.endpoints.remove(endpoint_id) {
                inner.vlan.release(ep.vlan_tag);
                report.dropped += 1;
            }
        }
        if !dropped.is_empty() {
            self.save_locked(&inner).await?;
        }
        drop(inner);

        self.migrate_legacy_bridges().await?;
        Ok(report)
    }

    /// Phase 4: after the listener is up, repair attachments and sweep
    /// orphans. Failures here are logged, never surfaced to users.
    pub async fn post_start_reconcile(&self, report: ReconcileReport) {
        for (container, network_id) in &report.reconnect_queue {
            if let Err(err) = self.reconnect_container_network(container, network_id).await {
                tracing::warn!(container, network_id, error = %err, "endpoint reconnect failed");
                metrics::counter!("agent_plugin_reconnect_failure", 1);
            } else {
                metrics::counter!("agent_plugin_reconnect_success", 1);
            }
        }
        if let Err(err) = self.ensure_lab_network_attachments().await {
            tracing::warn!(error = %err, "lab attachment repair failed");
        }
        match self.cleanup_orphaned_ports().await {
            Ok(count) if count > 0 => {
                tracing::info!(count, "removed orphaned OVS ports");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "orphan port cleanup failed"),
        }
    }

    /// Force Docker to recreate a missing endpoint by disconnecting and
    /// reconnecting the container on the interface network. The driver's
    /// CreateEndpoint runs again and re-provisions the veth.
    pub async fn reconnect_container_network(&self, container: &str, network_id: &str) -> Result<()> {
        let docker_client = docker::connect()?;
        if let Err(err) = docker::disconnect_network(&docker_client, network_id, container).await {
            tracing::debug!(container, network_id, error = %err, "disconnect before reconnect failed");
        }
        docker::connect_network(&docker_client, network_id, container).await?;
        tracing::info!(container, network_id, "reconnected container to network");
        Ok(())
    }

    /// Make sure every lab's containers are attached to each of the lab's
    /// interface networks, and recreate endpoints whose veths vanished.
    pub async fn ensure_lab_network_attachments(&self) -> Result<()> {
        let stale: Vec<(String, String)> = {
            let inner = self.inner.lock().await;
            inner
                .tables
                .endpoints
                .values()
                .filter(|ep| !iproute::link_exists_sys(&ep.host_veth))
                .filter_map(|ep| {
                    ep.container_name
                        .as_ref()
                        .map(|c| (c.clone(), ep.network_id.clone()))
                })
                .collect()
        };
        for (container, network_id) in stale {
            if let Err(err) = self.reconnect_container_network(&container, &network_id).await {
                tracing::warn!(container, network_id, error = %err, "stale veth reconnect failed");
            }
        }
        Ok(())
    }

    /// Delete `vh*` ports on the bridge that no tracked endpoint references.
    /// Only ports carrying our external_ids ownership claim are touched;
    /// operator-created ports that merely share the prefix are left alone.
    pub async fn cleanup_orphaned_ports(&self) -> Result<usize> {
        let tracked: HashSet<String> = {
            let inner = self.inner.lock().await;
            inner.tables.active_host_veths()
        };
        let mut removed = 0;
        for port in ovs::list_ports(&self.bridge_name).await? {
            if !port.starts_with("vh") || tracked.contains(&port) {
                continue;
            }
            if !ovs::port_is_owned(&port).await {
                tracing::warn!(port = %port, "untracked veth port lacks ownership claim, leaving alone");
                continue;
            }
            ovs::del_port(&self.bridge_name, &port).await?;
            let _ = iproute::delete_link(&port).await;
            tracing::info!(port = %port, "deleted orphaned OVS port");
            removed += 1;
        }
        Ok(removed)
    }

    /// Move ports off legacy per-lab bridges onto the shared bridge,
    /// preserving tags, then delete each emptied legacy bridge.
    pub async fn migrate_legacy_bridges(&self) -> Result<()> {
        for bridge in ovs::list_bridges().await? {
            if !bridge.starts_with(LEGACY_BRIDGE_PREFIX) || bridge == self.bridge_name {
                continue;
            }
            tracing::info!(legacy = %bridge, "migrating legacy lab bridge");
            ovs::ensure_bridge(&self.bridge_name).await?;
            for port in ovs::list_ports(&bridge).await? {
                let tag = ovs::get_port_tag(&port).await.ok().flatten();
                ovs::del_port(&bridge, &port).await?;
                match tag {
                    Some(tag) => ovs::add_port_with_tag(&self.bridge_name, &port, tag).await?,
                    None => {
                        ovs::vsctl_checked(&["--may-exist", "add-port", &self.bridge_name, &port])
                            .await?;
                    }
                }
            }
            if ovs::list_ports(&bridge).await?.is_empty() {
                ovs::delete_bridge(&bridge).await?;
                tracing::info!(legacy = %bridge, "deleted emptied legacy bridge");
            }
        }
        Ok(())
    }

    /// Tear down everything a lab owns on this agent: tunnels, external
    /// ports, endpoints, interface networks, management network.
    pub async fn full_lab_cleanup(&self, lab_id: &str) -> Result<()> {
        let (vnis, externals, endpoint_ids, network_ids) = {
            let inner = self.inner.lock().await;
            let Some(bridge) = inner.tables.lab_bridges.get(lab_id) else {
                return Ok(());
            };
            let endpoint_ids: Vec<String> = inner
                .tables
                .endpoints
                .values()
                .filter(|ep| {
                    inner
                        .tables
                        .networks
                        .get(&ep.network_id)
                        .map(|net| net.lab_id == lab_id)
                        .unwrap_or(false)
                })
                .map(|ep| ep.endpoint_id.clone())
                .collect();
            (
                bridge.vxlan_tunnels.keys().copied().collect::<Vec<_>>(),
                bridge.external_ports.keys().cloned().collect::<Vec<_>>(),
                endpoint_ids,
                bridge.network_ids.iter().cloned().collect::<Vec<_>>(),
            )
        };

        for vni in vnis {
            let _ = self.delete_vxlan_tunnel(lab_id, vni).await;
        }
        for interface in externals {
            let _ = self.detach_external_interface(lab_id, &interface).await;
        }
        for endpoint_id in endpoint_ids {
            let _ = self.delete_endpoint(&endpoint_id).await;
        }
        for network_id in network_ids {
            let _ = self.delete_network(&network_id).await;
        }
        let _ = self.delete_management_network(lab_id).await;

        let mut inner = self.inner.lock().await;
        inner.tables.lab_bridges.remove(lab_id);
        self.save_locked(&inner).await?;
        tracing::info!(lab_id, "cleaned up lab");
        Ok(())
    }

    async fn cleanup_expired_labs(&self) {
        let ttl = Duration::from_secs(settings().lab_bridge_ttl_secs);
        let now = chrono::Utc::now();
        let expired: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .tables
                .lab_bridges
                .values()
                .filter(|bridge| {
                    (now - bridge.last_activity).to_std().unwrap_or_default() > ttl
                })
                .map(|bridge| bridge.lab_id.clone())
                .collect()
        };
        for lab_id in expired {
            tracing::info!(lab_id, "lab bridge TTL expired, cleaning up");
            metrics::counter!("agent_plugin_ttl_cleanup", 1);
            if let Err(err) = self.full_lab_cleanup(&lab_id).await {
                tracing::error!(lab_id, error = %err, "TTL cleanup failed");
            }
        }
    }
}

/// What startup reconciliation found; consumed by the post-listener phase.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub bridge_recreated: bool,
    pub dropped: usize,
    /// (container_name, network_id) pairs needing a Docker reconnect.
    pub reconnect_queue: Vec<(String, String)>,
}

/// Periodic TTL sweep over idle lab bridges.
pub fn spawn_ttl_cleaner(plugin: Arc<OvsPlugin>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            plugin.cleanup_expired_labs().await;
        }
    })
}
