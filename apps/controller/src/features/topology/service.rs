//! Declarative topology import.
//!
//! Nodes upsert by their stable name; links dedupe by canonical name with
//! source/target swapped into canonical order. Importing the same graph
//! twice is a no-op (zero created rows on the second pass).

use anyhow::{anyhow, Result};
use archetype_types::{canonical_order, LinkEndpoint};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::features::labs::repo::{self, LabRow, LinkRow, NodeRow};

#[derive(Debug, Clone, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub interface_count: Option<i32>,
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default)]
    pub startup_config: Option<String>,
}

fn default_kind() -> String {
    "linux".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphLink {
    /// Endpoint refs in `"{node_id}:{interface}"` form.
    pub endpoints: [String; 2],
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopologyGraph {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub links: Vec<GraphLink>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportResult {
    pub nodes_created: usize,
    pub nodes_updated: usize,
    pub links_created: usize,
    pub links_skipped: usize,
}

fn sanitize_node_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn parse_endpoint_ref(raw: &str) -> Result<(String, String)> {
    let (node_id, interface) = raw
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("malformed endpoint ref {raw}"))?;
    if node_id.is_empty() || interface.is_empty() {
        return Err(anyhow!("malformed endpoint ref {raw}"));
    }
    Ok((node_id.to_string(), interface.to_string()))
}

pub async fn import_topology(
    db: &PgPool,
    lab_id: &str,
    graph: &TopologyGraph,
) -> Result<ImportResult> {
    let mut result = ImportResult::default();

    if repo::get_lab(db, lab_id).await?.is_none() {
        repo::upsert_lab(
            db,
            &LabRow {
                id: lab_id.to_string(),
                name: lab_id.to_string(),
                agent_id: None,
            },
        )
        .await?;
    }

    // Node id -> sanitized name, for link endpoint resolution.
    let mut id_to_name = std::collections::HashMap::new();
    let existing_nodes = repo::nodes_for_lab(db, lab_id).await?;

    for node in &graph.nodes {
        let name = sanitize_node_name(&node.name);
        id_to_name.insert(node.id.clone(), name.clone());

        if let Some(existing) = existing_nodes.iter().find(|n| n.name == name) {
            let updated = NodeRow {
                id: existing.id,
                lab_id: lab_id.to_string(),
                name: name.clone(),
                display_name: node.display_name.clone(),
                kind: node.kind.clone(),
                image: node.image.clone(),
                host_id: node.host_id.clone(),
                interface_count: node.interface_count,
                startup_config: node.startup_config.clone(),
            };
            repo::update_node(db, &updated).await?;
            result.nodes_updated += 1;
        } else {
            repo::insert_node(
                db,
                &NodeRow {
                    id: Uuid::new_v4(),
                    lab_id: lab_id.to_string(),
                    name: name.clone(),
                    display_name: node.display_name.clone(),
                    kind: node.kind.clone(),
                    image: node.image.clone(),
                    host_id: node.host_id.clone(),
                    interface_count: node.interface_count,
                    startup_config: node.startup_config.clone(),
                },
            )
            .await?;
            result.nodes_created += 1;
        }
    }

    let existing_links: std::collections::HashSet<String> = repo::links_for_lab(db, lab_id)
        .await?
        .into_iter()
        .map(|l| l.link_name)
        .collect();

    for link in &graph.links {
        let (id_a, iface_a) = parse_endpoint_ref(&link.endpoints[0])?;
        let (id_b, iface_b) = parse_endpoint_ref(&link.endpoints[1])?;
        let name_a = id_to_name
            .get(&id_a)
            .cloned()
            .ok_or_else(|| anyhow!("link references unknown node {id_a}"))?;
        let name_b = id_to_name
            .get(&id_b)
            .cloned()
            .ok_or_else(|| anyhow!("link references unknown node {id_b}"))?;

        let ep_a = LinkEndpoint::new(name_a, iface_a);
        let ep_b = LinkEndpoint::new(name_b, iface_b);
        let (source, target) = canonical_order(&ep_a, &ep_b);
        let link_name = format!(
            "{}:{}-{}:{}",
            source.node, source.interface, target.node, target.interface
        );

        if existing_links.contains(&link_name) {
            result.links_skipped += 1;
            continue;
        }
        repo::insert_link(
            db,
            &LinkRow {
                id: Uuid::new_v4(),
                lab_id: lab_id.to_string(),
                link_name,
                source_node: source.node.clone(),
                source_interface: source.interface.clone(),
                target_node: target.node.clone(),
                target_interface: target.interface.clone(),
            },
        )
        .await?;
        result.links_created += 1;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_graph() -> TopologyGraph {
        TopologyGraph {
            nodes: vec![
                GraphNode {
                    id: "n-zzz".into(),
                    name: "zzz".into(),
                    display_name: None,
                    kind: "linux".into(),
                    image: "alpine".into(),
                    interface_count: None,
                    host_id: None,
                    startup_config: None,
                },
                GraphNode {
                    id: "n-aaa".into(),
                    name: "aaa".into(),
                    display_name: None,
                    kind: "linux".into(),
                    image: "alpine".into(),
                    interface_count: None,
                    host_id: None,
                    startup_config: None,
                },
            ],
            links: vec![GraphLink {
                endpoints: ["n-zzz:eth1".into(), "n-aaa:eth2".into()],
            }],
        }
    }

    #[tokio::test]
    async fn import_canonicalizes_and_is_idempotent() {
        let db = PgPool::connect_lazy("postgres://unused").unwrap();

        let first = import_topology(&db, "lab-imp-1", &two_node_graph()).await.unwrap();
        assert_eq!(first.nodes_created, 2);
        assert_eq!(first.links_created, 1);

        let links = repo::links_for_lab(&db, "lab-imp-1").await.unwrap();
        assert_eq!(links.len(), 1);
        let link = &links[0];
        // Endpoints sorted lexicographically: aaa before zzz, fields
        // swapped to match.
        assert_eq!(link.link_name, "aaa:eth2-zzz:eth1");
        assert_eq!(link.source_node, "aaa");
        assert_eq!(link.source_interface, "eth2");
        assert_eq!(link.target_node, "zzz");
        assert_eq!(link.target_interface, "eth1");

        let second = import_topology(&db, "lab-imp-1", &two_node_graph()).await.unwrap();
        assert_eq!(second.nodes_created, 0);
        assert_eq!(second.links_created, 0);
        assert_eq!(second.links_skipped, 1);
        assert_eq!(repo::links_for_lab(&db, "lab-imp-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn endpoint_refs_must_resolve() {
        let db = PgPool::connect_lazy("postgres://unused").unwrap();
        let mut graph = two_node_graph();
        graph.links[0].endpoints[0] = "n-ghost:eth1".into();
        assert!(import_topology(&db, "lab-imp-2", &graph).await.is_err());
    }

    #[test]
    fn endpoint_ref_parsing() {
        assert_eq!(
            parse_endpoint_ref("n-abc:eth3").unwrap(),
            ("n-abc".into(), "eth3".into())
        );
        assert!(parse_endpoint_ref("noseparator").is_err());
        assert!(parse_endpoint_ref(":eth1").is_err());
    }
}
