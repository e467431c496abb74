//! Topology slicing: the subset of a lab one agent should see.

use std::collections::{HashMap, HashSet};

use archetype_types::{
    required_interface_count, DeployTopology, LinkEndpoint, TopologyLinkSpec, TopologyNodeSpec,
};

use crate::features::labs::repo::{LinkRow, NodeRow};

/// Which nodes land on `agent_id`:
/// - every node explicitly pinned there,
/// - every requested node whose placement resolved there,
/// - every node already placed there (running or stopped).
/// Links survive only when both endpoints survive. Interface counts are
/// baked into the node specs so the agent pre-provisions enough veths.
pub fn filter_topology_for_agent(
    lab_id: &str,
    nodes: &[NodeRow],
    links: &[LinkRow],
    resolved: &HashMap<String, String>,
    existing_placements: &HashMap<String, String>,
    agent_id: &str,
) -> DeployTopology {
    let kept: HashSet<&str> = nodes
        .iter()
        .filter(|node| {
            if node.host_id.as_deref() == Some(agent_id) {
                return true;
            }
            if resolved.get(&node.name).map(|a| a.as_str()) == Some(agent_id) {
                return true;
            }
            existing_placements.get(&node.name).map(|a| a.as_str()) == Some(agent_id)
        })
        .map(|node| node.name.as_str())
        .collect();

    let link_specs: Vec<TopologyLinkSpec> = links
        .iter()
        .filter(|link| {
            kept.contains(link.source_node.as_str()) && kept.contains(link.target_node.as_str())
        })
        .map(|link| TopologyLinkSpec {
            endpoints: [
                LinkEndpoint::new(&link.source_node, &link.source_interface),
                LinkEndpoint::new(&link.target_node, &link.target_interface),
            ],
            link_id: Some(link.link_name.clone()),
        })
        .collect();

    // Highest interface index referenced by ANY lab link, kept or not: a
    // node whose peer lives on another host still needs the local veth.
    let mut max_linked: HashMap<&str, u32> = HashMap::new();
    for link in links {
        for (node, interface) in [
            (&link.source_node, &link.source_interface),
            (&link.target_node, &link.target_interface),
        ] {
            if let Some(index) = interface.strip_prefix("eth").and_then(|i| i.parse().ok()) {
                let entry = max_linked.entry(node.as_str()).or_insert(0);
                *entry = (*entry).max(index);
            }
        }
    }

    let node_specs: Vec<TopologyNodeSpec> = nodes
        .iter()
        .filter(|node| kept.contains(node.name.as_str()))
        .map(|node| {
            let max_ports = node.interface_count.unwrap_or(0).max(0) as u32;
            let linked = max_linked.get(node.name.as_str()).copied().unwrap_or(0);
            TopologyNodeSpec {
                name: node.name.clone(),
                display_name: node.display_name.clone(),
                kind: node.kind.clone(),
                image: node.image.clone(),
                startup_config: node.startup_config.clone(),
                interface_count: Some(required_interface_count(max_ports, linked)),
                host_id: node.host_id.clone(),
            }
        })
        .collect();

    DeployTopology {
        lab_id: lab_id.to_string(),
        nodes: node_specs,
        links: link_specs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn node(name: &str, host_id: Option<&str>) -> NodeRow {
        NodeRow {
            id: Uuid::new_v4(),
            lab_id: "lab-f".into(),
            name: name.into(),
            display_name: None,
            kind: "linux".into(),
            image: "alpine".into(),
            host_id: host_id.map(|s| s.to_string()),
            interface_count: None,
            startup_config: None,
        }
    }

    fn link(a: &str, ia: &str, b: &str, ib: &str) -> LinkRow {
        LinkRow {
            id: Uuid::new_v4(),
            lab_id: "lab-f".into(),
            link_name: format!("{a}:{ia}-{b}:{ib}"),
            source_node: a.into(),
            source_interface: ia.into(),
            target_node: b.into(),
            target_interface: ib.into(),
        }
    }

    #[test]
    fn pinned_resolved_and_placed_nodes_survive() {
        let nodes = vec![node("pinned", Some("agent-1")), node("auto", None), node("other", None)];
        let links = vec![];
        let resolved: HashMap<String, String> =
            [("auto".to_string(), "agent-1".to_string())].into();
        let placements: HashMap<String, String> =
            [("other".to_string(), "agent-2".to_string())].into();

        let slice =
            filter_topology_for_agent("lab-f", &nodes, &links, &resolved, &placements, "agent-1");
        let names: Vec<&str> = slice.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["pinned", "auto"]);
    }

    #[test]
    fn links_need_both_endpoints_local() {
        let nodes = vec![node("a", Some("agent-1")), node("b", Some("agent-1")), node("c", Some("agent-2"))];
        let links = vec![link("a", "eth1", "b", "eth1"), link("a", "eth2", "c", "eth1")];

        let slice = filter_topology_for_agent(
            "lab-f",
            &nodes,
            &links,
            &HashMap::new(),
            &HashMap::new(),
            "agent-1",
        );
        assert_eq!(slice.links.len(), 1);
        assert_eq!(slice.links[0].link_id.as_deref(), Some("a:eth1-b:eth1"));
    }

    #[test]
    fn interface_counts_cover_cross_host_peers() {
        // a:eth7 links to a node on another agent; a still needs eth7
        // locally, so its count is 7 + 4 headroom.
        let nodes = vec![node("a", Some("agent-1")), node("far", Some("agent-2"))];
        let links = vec![link("a", "eth7", "far", "eth1")];

        let slice = filter_topology_for_agent(
            "lab-f",
            &nodes,
            &links,
            &HashMap::new(),
            &HashMap::new(),
            "agent-1",
        );
        assert_eq!(slice.nodes.len(), 1);
        assert_eq!(slice.nodes[0].interface_count, Some(11));
    }
}
