//! Hot link rewiring: connect two interfaces by giving their OVS ports the
//! same VLAN tag, disconnect by retagging one side to a fresh unique tag,
//! and simulate cable pulls by combining retag with carrier off.

use anyhow::{anyhow, bail, Result};

use crate::core::{docker, iproute, ovs};

use super::state::EndpointState;
use super::OvsPlugin;

impl OvsPlugin {
    /// Look up a tracked endpoint, verifying lab ownership. Endpoints from a
    /// different lab are a fatal invariant violation (cross-lab bleed).
    async fn resolve_endpoint(
        &self,
        lab_id: &str,
        container: &str,
        interface: &str,
    ) -> Result<EndpointState> {
        {
            let inner = self.inner.lock().await;
            if let Some(ep) = inner.tables.find_endpoint(container, interface) {
                let ep_lab = inner
                    .tables
                    .endpoint_lab(ep)
                    .ok_or_else(|| anyhow!("endpoint {} has no network", ep.endpoint_id))?;
                if ep_lab != lab_id {
                    bail!(
                        "endpoint {container}:{interface} belongs to lab {ep_lab}, not {lab_id}"
                    );
                }
                if !ovs::port_exists(&self.bridge_name, &ep.host_veth).await {
                    bail!(
                        "endpoint {container}:{interface} has no OVS port ({})",
                        ep.host_veth
                    );
                }
                return Ok(ep.clone());
            }
        }
        // Tracking may have been lost across an agent restart; try to
        // rediscover from Docker + OVS before giving up.
        self.discover_endpoint(lab_id, container, interface)
            .await?
            .ok_or_else(|| anyhow!("endpoint not found for {container}:{interface}"))
    }

    /// Rebuild a lost EndpointState from Docker's view of the container and
    /// the live OVS port tag.
    pub async fn discover_endpoint(
        &self,
        lab_id: &str,
        container: &str,
        interface: &str,
    ) -> Result<Option<EndpointState>> {
        let docker_client = docker::connect()?;
        let inspect = match docker_client.inspect_container(container, None).await {
            Ok(inspect) => inspect,
            Err(_) => return Ok(None),
        };
        let networks = inspect
            .network_settings
            .and_then(|ns| ns.networks)
            .unwrap_or_default();

        let mut inner = self.inner.lock().await;
        for (net_name, attachment) in networks {
            let Some(endpoint_id) = attachment.endpoint_id else {
                continue;
            };
            if endpoint_id.is_empty() {
                continue;
            }
            // Interface networks are named `{lab}-{iface}`; match on suffix.
            if !net_name.ends_with(&format!("-{interface}")) {
                continue;
            }
            let Some(network_id) = attachment.network_id else {
                continue;
            };
            let net = inner.tables.networks.get(&network_id).cloned();
            let Some(net) = net else { continue };
            if net.lab_id != lab_id || net.interface_name != interface {
                continue;
            }
            // Find the live OVS port for this endpoint by prefix.
            let prefix: String = endpoint_id.chars().take(5).collect();
            let host_veth = ovs::list_ports(&self.bridge_name)
                .await?
                .into_iter()
                .find(|p| p.starts_with(&format!("vh{prefix}")));
            let Some(host_veth) = host_veth else { continue };
            let vlan_tag = ovs::get_port_tag(&host_veth).await?.unwrap_or_default();
            let cont_veth = format!("vc{}", &host_veth[2..]);

            let ep = EndpointState {
                endpoint_id: endpoint_id.clone(),
                network_id,
                interface_name: interface.to_string(),
                host_veth,
                cont_veth,
                vlan_tag,
                container_name: Some(container.to_string()),
            };
            inner.vlan.mark_allocated(vlan_tag);
            inner.tables.endpoints.insert(endpoint_id, ep.clone());
            self.save_locked(&inner).await?;
            tracing::info!(container, interface, "rediscovered endpoint from docker");
            return Ok(Some(ep));
        }
        Ok(None)
    }

    /// Connect two interfaces by setting both ports to endpoint A's tag.
    /// Returns the shared tag.
    pub async fn hot_connect(
        &self,
        lab_id: &str,
        container_a: &str,
        iface_a: &str,
        container_b: &str,
        iface_b: &str,
    ) -> Result<u16> {
        let ep_a = self.resolve_endpoint(lab_id, container_a, iface_a).await?;
        let ep_b = self.resolve_endpoint(lab_id, container_b, iface_b).await?;

        let shared_vlan = ep_a.vlan_tag;
        ovs::set_port_tag(&ep_b.host_veth, shared_vlan).await?;

        let mut inner = self.inner.lock().await;
        if let Some(ep) = inner.tables.endpoints.get_mut(&ep_b.endpoint_id) {
            ep.vlan_tag = shared_vlan;
        }
        inner.tables.touch_lab(lab_id);
        self.save_locked(&inner).await?;
        tracing::info!(
            lab_id,
            vlan = shared_vlan,
            "connected {container_a}:{iface_a} <-> {container_b}:{iface_b}"
        );
        Ok(shared_vlan)
    }

    /// Disconnect one interface by moving it to a fresh unique tag.
    pub async fn hot_disconnect(
        &self,
        lab_id: &str,
        container: &str,
        interface: &str,
    ) -> Result<u16> {
        let ep = self.resolve_endpoint(lab_id, container, interface).await?;

        let mut inner = self.inner.lock().await;
        let new_vlan = self.allocate_vlan(&mut inner).await?;
        if let Err(err) = ovs::set_port_tag(&ep.host_veth, new_vlan).await {
            inner.vlan.release(new_vlan);
            return Err(err);
        }
        inner.vlan.release(ep.vlan_tag);
        if let Some(tracked) = inner.tables.endpoints.get_mut(&ep.endpoint_id) {
            tracked.vlan_tag = new_vlan;
        }
        inner.tables.touch_lab(lab_id);
        self.save_locked(&inner).await?;
        tracing::info!(lab_id, new_vlan, "disconnected {container}:{interface}");
        Ok(new_vlan)
    }

    /// Set carrier on/off on an interface inside the container namespace.
    pub async fn set_carrier_state(
        &self,
        container: &str,
        interface: &str,
        up: bool,
    ) -> Result<()> {
        let docker_client = docker::connect()?;
        let pid = docker::container_pid(&docker_client, container)
            .await?
            .ok_or_else(|| anyhow!("container {container} not running"))?;
        iproute::set_carrier(pid, interface, up).await
    }

    /// Simulate a cable disconnect: fresh unique VLAN plus carrier off.
    pub async fn isolate_port(
        &self,
        lab_id: &str,
        container: &str,
        interface: &str,
    ) -> Result<u16> {
        let new_vlan = self.hot_disconnect(lab_id, container, interface).await?;
        if let Err(err) = self.set_carrier_state(container, interface, false).await {
            // Isolation still holds at L2; carrier is best-effort.
            tracing::warn!(container, interface, error = %err, "VLAN isolated but carrier off failed");
        }
        Ok(new_vlan)
    }

    /// Reconnect a previously isolated port: set the peer's VLAN, carrier on.
    pub async fn restore_port(
        &self,
        lab_id: &str,
        container: &str,
        interface: &str,
        target_vlan: u16,
    ) -> Result<()> {
        let ep = self.resolve_endpoint(lab_id, container, interface).await?;

        ovs::set_port_tag(&ep.host_veth, target_vlan).await?;
        let mut inner = self.inner.lock().await;
        inner.vlan.release(ep.vlan_tag);
        inner.vlan.mark_allocated(target_vlan);
        if let Some(tracked) = inner.tables.endpoints.get_mut(&ep.endpoint_id) {
            tracked.vlan_tag = target_vlan;
        }
        inner.tables.touch_lab(lab_id);
        self.save_locked(&inner).await?;
        drop(inner);

        self.set_carrier_state(container, interface, true).await?;
        tracing::info!(lab_id, target_vlan, "restored {container}:{interface}");
        Ok(())
    }

    pub async fn endpoint_vlan(&self, container: &str, interface: &str) -> Option<u16> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .find_endpoint(container, interface)
            .map(|ep| ep.vlan_tag)
    }
}
