//! Cross-host overlay: VXLAN tunnel ports on the shared bridge, external
//! physical interface attachment, and the guarded VXLAN port sweep.

use anyhow::{anyhow, bail, Result};
use archetype_types::{VNI_RANGE_END, VNI_RANGE_START};

use crate::core::{cmd, iproute, ovs};

use super::OvsPlugin;

impl OvsPlugin {
    /// Create a VXLAN port on the shared bridge for one cross-host link.
    /// The VNI comes from the controller's allocator; out-of-range values
    /// are rejected here rather than trusted.
    pub async fn create_vxlan_tunnel(
        &self,
        lab_id: &str,
        local_ip: &str,
        remote_ip: &str,
        vni: u32,
        vlan_tag: u16,
    ) -> Result<String> {
        if !(VNI_RANGE_START..=VNI_RANGE_END).contains(&vni) {
            bail!("VNI {vni} outside allowed range [{VNI_RANGE_START}, {VNI_RANGE_END}]");
        }
        let mut inner = self.inner.lock().await;
        self.ensure_lab_bridge(&mut inner, lab_id).await?;

        let bridge = inner
            .tables
            .lab_bridges
            .get(lab_id)
            .ok_or_else(|| anyhow!("lab bridge not found for {lab_id}"))?;
        if let Some(existing) = bridge.vxlan_tunnels.get(&vni) {
            return Ok(existing.clone());
        }

        let vxlan_port = format!("vx{vni}");
        iproute::create_vxlan(&vxlan_port, vni, local_ip, remote_ip, self.vxlan_dst_port).await?;

        if let Err(err) = ovs::add_port_with_tag(&self.bridge_name, &vxlan_port, vlan_tag).await {
            let _ = iproute::delete_link(&vxlan_port).await;
            return Err(err);
        }
        inner.vlan.mark_allocated(vlan_tag);

        if let Some(bridge) = inner.tables.lab_bridges.get_mut(lab_id) {
            bridge.vxlan_tunnels.insert(vni, vxlan_port.clone());
        }
        inner.tables.touch_lab(lab_id);
        self.save_locked(&inner).await?;
        tracing::info!(lab_id, vni, remote_ip, vlan_tag, port = %vxlan_port, "created VXLAN tunnel");
        Ok(vxlan_port)
    }

    pub async fn delete_vxlan_tunnel(&self, lab_id: &str, vni: u32) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(vxlan_port) = inner
            .tables
            .lab_bridges
            .get_mut(lab_id)
            .and_then(|bridge| bridge.vxlan_tunnels.remove(&vni))
        else {
            return Ok(false);
        };
        ovs::del_port(&self.bridge_name, &vxlan_port).await?;
        let _ = iproute::delete_link(&vxlan_port).await;
        self.save_locked(&inner).await?;
        tracing::info!(lab_id, vni, port = %vxlan_port, "deleted VXLAN tunnel");
        Ok(true)
    }

    /// Attach a physical host interface to a lab's broadcast domain by
    /// adding it to the bridge with the lab's VLAN tag.
    pub async fn attach_external_interface(
        &self,
        lab_id: &str,
        interface: &str,
        vlan_tag: Option<u16>,
    ) -> Result<u16> {
        if !iproute::link_exists(interface).await {
            bail!("interface {interface} not found on this host");
        }
        let mut inner = self.inner.lock().await;
        self.ensure_lab_bridge(&mut inner, lab_id).await?;

        let tag = match vlan_tag {
            Some(tag) => {
                inner.vlan.mark_allocated(tag);
                tag
            }
            None => self.allocate_vlan(&mut inner).await?,
        };
        ovs::add_port_with_tag(&self.bridge_name, interface, tag).await?;
        cmd::run_checked("ip", &["link", "set", interface, "up"]).await?;

        if let Some(bridge) = inner.tables.lab_bridges.get_mut(lab_id) {
            bridge.external_ports.insert(interface.to_string(), tag);
        }
        inner.tables.touch_lab(lab_id);
        self.save_locked(&inner).await?;
        tracing::info!(lab_id, interface, tag, "attached external interface");
        Ok(tag)
    }

    pub async fn detach_external_interface(&self, lab_id: &str, interface: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(tag) = inner
            .tables
            .lab_bridges
            .get_mut(lab_id)
            .and_then(|bridge| bridge.external_ports.remove(interface))
        else {
            return Ok(false);
        };
        ovs::del_port(&self.bridge_name, interface).await?;
        inner.vlan.release(tag);
        self.save_locked(&inner).await?;
        tracing::info!(lab_id, interface, "detached external interface");
        Ok(true)
    }

    pub async fn list_external_interfaces(&self, lab_id: &str) -> Vec<(String, u16)> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .lab_bridges
            .get(lab_id)
            .map(|bridge| {
                bridge
                    .external_ports
                    .iter()
                    .map(|(name, tag)| (name.clone(), *tag))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Delete VXLAN ports on the bridge that are not in the controller's
    /// valid set. An empty set would wipe every tunnel, so it requires the
    /// caller to assert force && confirm && allow_empty.
    pub async fn reconcile_overlay_ports(
        &self,
        valid_port_names: &[String],
        force: bool,
        confirm: bool,
        allow_empty: bool,
    ) -> Result<Vec<String>> {
        if valid_port_names.is_empty() && !(force && confirm && allow_empty) {
            bail!("refusing to reconcile with an empty valid set without force+confirm+allow_empty");
        }
        let valid: std::collections::HashSet<&str> =
            valid_port_names.iter().map(|s| s.as_str()).collect();

        let mut deleted = Vec::new();
        for port in ovs::list_ports(&self.bridge_name).await? {
            if !port.starts_with("vx") {
                continue;
            }
            if valid.contains(port.as_str()) {
                continue;
            }
            ovs::del_port(&self.bridge_name, &port).await?;
            let _ = iproute::delete_link(&port).await;
            tracing::info!(port = %port, "removed stale VXLAN port");
            deleted.push(port);
        }

        // Drop tunnel bookkeeping that pointed at deleted ports.
        if !deleted.is_empty() {
            let mut inner = self.inner.lock().await;
            let deleted_set: std::collections::HashSet<&str> =
                deleted.iter().map(|s| s.as_str()).collect();
            for bridge in inner.tables.lab_bridges.values_mut() {
                bridge
                    .vxlan_tunnels
                    .retain(|_, port| !deleted_set.contains(port.as_str()));
            }
            self.save_locked(&inner).await?;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::OvsPlugin;

    /// VNIs are controller-allocated; the agent rejects out-of-range values
    /// before touching the system.
    #[tokio::test]
    async fn out_of_range_vni_is_rejected() {
        let plugin = OvsPlugin::new();
        for vni in [0u32, 99_999, 200_000, u32::MAX] {
            let err = plugin
                .create_vxlan_tunnel("lab1", "10.0.0.1", "10.0.0.2", vni, 150)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("outside allowed range"), "{err}");
        }
    }

    /// An empty valid set requires the full force+confirm+allow_empty
    /// assertion; anything less refuses.
    #[tokio::test]
    async fn empty_reconcile_set_is_guarded() {
        let plugin = OvsPlugin::new();
        for (force, confirm, allow_empty) in [
            (false, false, false),
            (true, false, false),
            (true, true, false),
            (false, true, true),
        ] {
            let err = plugin
                .reconcile_overlay_ports(&[], force, confirm, allow_empty)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("refusing"), "{err}");
        }
    }
}
