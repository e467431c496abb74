//! Interface math and post-start interface renaming.
//!
//! Docker names interfaces by attach order, which is frequently wrong for
//! our purposes: the canonical name for each attachment is recorded in
//! NetworkState. After start we locate each attachment inside the container
//! by the veth peer ifindex and rename it to the intended name.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use archetype_types::{required_interface_count, DeployTopology};

use crate::core::{docker, iproute};
use crate::plugin::OvsPlugin;

/// Highest interface index any link references for `node` (eth7 -> 7).
pub fn max_linked_index(topology: &DeployTopology, node: &str) -> u32 {
    topology
        .links
        .iter()
        .flat_map(|link| link.endpoints.iter())
        .filter(|ep| ep.node == node)
        .filter_map(|ep| ep.interface.strip_prefix("eth"))
        .filter_map(|idx| idx.parse().ok())
        .max()
        .unwrap_or(0)
}

/// Data interfaces to pre-provision for a node.
pub fn interface_count_for(topology: &DeployTopology, node: &str) -> u32 {
    let max_ports = topology
        .nodes
        .iter()
        .find(|n| n.name == node)
        .and_then(|n| n.interface_count)
        .unwrap_or(0);
    required_interface_count(max_ports, max_linked_index(topology, node))
}

/// Rename the container's attached interfaces to their canonical names.
/// Returns how many interfaces were renamed.
pub async fn fix_interface_names(
    plugin: &Arc<OvsPlugin>,
    docker_client: &bollard::Docker,
    container_name: &str,
) -> Result<usize> {
    let Some(pid) = docker::container_pid(docker_client, container_name).await? else {
        return Ok(0);
    };

    // Intended name per endpoint, resolved through the plugin tables.
    let endpoints: Vec<(String, String)> = {
        let inner = plugin.inner.lock().await;
        inner
            .tables
            .endpoints
            .values()
            .filter(|ep| ep.container_name.as_deref() == Some(container_name))
            .map(|ep| (ep.host_veth.clone(), ep.interface_name.clone()))
            .collect()
    };

    // Resolve every current name first so renames do not invalidate the
    // ifindex mapping mid-pass.
    let mut plan: HashMap<String, String> = HashMap::new();
    for (host_veth, intended) in &endpoints {
        let ifindex = match iproute::peer_ifindex(host_veth).await {
            Ok(ifindex) => ifindex,
            Err(err) => {
                tracing::warn!(container = container_name, host_veth = %host_veth, error = %err, "no peer ifindex");
                continue;
            }
        };
        if let Some(current) = iproute::find_interface_by_ifindex(pid, ifindex).await? {
            if &current != intended {
                plan.insert(current, intended.clone());
            }
        }
    }

    let mut renamed = 0;
    for (current, intended) in plan {
        match iproute::rename_in_container(pid, &current, &intended).await {
            Ok(()) => {
                tracing::info!(container = container_name, from = %current, to = %intended, "renamed interface");
                renamed += 1;
            }
            Err(err) => {
                tracing::warn!(container = container_name, from = %current, to = %intended, error = %err, "interface rename failed");
            }
        }
    }
    Ok(renamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use archetype_types::{LinkEndpoint, TopologyLinkSpec};

    fn topology_with_links(links: Vec<(&str, &str, &str, &str)>) -> DeployTopology {
        DeployTopology {
            lab_id: "lab1".into(),
            nodes: vec![],
            links: links
                .into_iter()
                .map(|(na, ia, nb, ib)| TopologyLinkSpec {
                    endpoints: [LinkEndpoint::new(na, ia), LinkEndpoint::new(nb, ib)],
                    link_id: None,
                })
                .collect(),
        }
    }

    #[test]
    fn max_linked_index_scans_both_endpoints() {
        let topo = topology_with_links(vec![("a", "eth1", "b", "eth7"), ("a", "eth3", "c", "eth2")]);
        assert_eq!(max_linked_index(&topo, "a"), 3);
        assert_eq!(max_linked_index(&topo, "b"), 7);
        assert_eq!(max_linked_index(&topo, "d"), 0);
    }

    #[test]
    fn interface_count_applies_floor_and_headroom() {
        let topo = topology_with_links(vec![("a", "eth1", "b", "eth1")]);
        // 1 linked index + 4 headroom
        assert_eq!(interface_count_for(&topo, "a"), 5);
        // unlinked node still gets the minimum
        assert_eq!(interface_count_for(&topo, "z"), 4);
    }
}
