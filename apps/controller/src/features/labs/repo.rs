//! Lab-domain rows: labs, nodes, links, placements, node states.
//!
//! Runtime sqlx queries against Postgres; unit tests swap in process-local
//! stores so lifecycle logic runs without a database.

use archetype_types::{DesiredState, NodeStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LabRow {
    pub id: String,
    pub name: String,
    /// Default agent for auto-placed nodes.
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct NodeRow {
    pub id: Uuid,
    pub lab_id: String,
    /// Sanitized container_name; unique within the lab, stable across
    /// redeployments.
    pub name: String,
    pub display_name: Option<String>,
    pub kind: String,
    pub image: String,
    /// Explicit host pin.
    pub host_id: Option<String>,
    pub interface_count: Option<i32>,
    pub startup_config: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LinkRow {
    pub id: Uuid,
    pub lab_id: String,
    /// Canonical `"node:iface-node:iface"`; the link's identity.
    pub link_name: String,
    pub source_node: String,
    pub source_interface: String,
    pub target_node: String,
    pub target_interface: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct NodePlacementRow {
    pub lab_id: String,
    pub node_name: String,
    pub host_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct NodeStateRow {
    pub lab_id: String,
    pub node_id: Uuid,
    pub node_name: String,
    pub desired_state: String,
    pub actual_state: String,
    pub starting_started_at: Option<DateTime<Utc>>,
    pub stopping_started_at: Option<DateTime<Utc>>,
    pub boot_started_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub is_ready: bool,
    pub image_sync_status: Option<String>,
}

impl NodeStateRow {
    pub fn desired(&self) -> DesiredState {
        if self.desired_state == "stopped" {
            DesiredState::Stopped
        } else {
            DesiredState::Running
        }
    }

    pub fn actual(&self) -> NodeStatus {
        NodeStatus::parse(&self.actual_state).unwrap_or(NodeStatus::Undeployed)
    }
}

// =====================================================================
// Postgres implementations
// =====================================================================

#[cfg(not(test))]
mod pg {
    use super::*;

    pub async fn get_lab(db: &PgPool, id: &str) -> sqlx::Result<Option<LabRow>> {
        sqlx::query_as::<_, LabRow>(r#"SELECT * FROM labs WHERE id=$1"#)
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn upsert_lab(db: &PgPool, row: &LabRow) -> sqlx::Result<()> {
        sqlx::query(
            r#"INSERT INTO labs (id, name, agent_id) VALUES ($1,$2,$3)
               ON CONFLICT (id) DO UPDATE SET name=$2, agent_id=$3"#,
        )
        .bind(&row.id)
        .bind(&row.name)
        .bind(&row.agent_id)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn all_lab_ids(db: &PgPool) -> sqlx::Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(r#"SELECT id FROM labs"#)
            .fetch_all(db)
            .await
    }

    pub async fn nodes_for_lab(db: &PgPool, lab_id: &str) -> sqlx::Result<Vec<NodeRow>> {
        sqlx::query_as::<_, NodeRow>(r#"SELECT * FROM nodes WHERE lab_id=$1 ORDER BY name"#)
            .bind(lab_id)
            .fetch_all(db)
            .await
    }

    pub async fn insert_node(db: &PgPool, row: &NodeRow) -> sqlx::Result<()> {
        sqlx::query(
            r#"INSERT INTO nodes
               (id, lab_id, name, display_name, kind, image, host_id, interface_count, startup_config)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)"#,
        )
        .bind(row.id)
        .bind(&row.lab_id)
        .bind(&row.name)
        .bind(&row.display_name)
        .bind(&row.kind)
        .bind(&row.image)
        .bind(&row.host_id)
        .bind(row.interface_count)
        .bind(&row.startup_config)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn update_node(db: &PgPool, row: &NodeRow) -> sqlx::Result<()> {
        sqlx::query(
            r#"UPDATE nodes SET display_name=$3, kind=$4, image=$5, host_id=$6,
               interface_count=$7, startup_config=$8
               WHERE lab_id=$1 AND name=$2"#,
        )
        .bind(&row.lab_id)
        .bind(&row.name)
        .bind(&row.display_name)
        .bind(&row.kind)
        .bind(&row.image)
        .bind(&row.host_id)
        .bind(row.interface_count)
        .bind(&row.startup_config)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn links_for_lab(db: &PgPool, lab_id: &str) -> sqlx::Result<Vec<LinkRow>> {
        sqlx::query_as::<_, LinkRow>(r#"SELECT * FROM links WHERE lab_id=$1 ORDER BY link_name"#)
            .bind(lab_id)
            .fetch_all(db)
            .await
    }

    pub async fn insert_link(db: &PgPool, row: &LinkRow) -> sqlx::Result<()> {
        sqlx::query(
            r#"INSERT INTO links
               (id, lab_id, link_name, source_node, source_interface, target_node, target_interface)
               VALUES ($1,$2,$3,$4,$5,$6,$7)"#,
        )
        .bind(row.id)
        .bind(&row.lab_id)
        .bind(&row.link_name)
        .bind(&row.source_node)
        .bind(&row.source_interface)
        .bind(&row.target_node)
        .bind(&row.target_interface)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn placements_for_lab(db: &PgPool, lab_id: &str) -> sqlx::Result<Vec<NodePlacementRow>> {
        sqlx::query_as::<_, NodePlacementRow>(
            r#"SELECT * FROM node_placements WHERE lab_id=$1"#,
        )
        .bind(lab_id)
        .fetch_all(db)
        .await
    }

    pub async fn upsert_placement(db: &PgPool, row: &NodePlacementRow) -> sqlx::Result<()> {
        sqlx::query(
            r#"INSERT INTO node_placements (lab_id, node_name, host_id, status)
               VALUES ($1,$2,$3,$4)
               ON CONFLICT (lab_id, node_name) DO UPDATE SET host_id=$3, status=$4"#,
        )
        .bind(&row.lab_id)
        .bind(&row.node_name)
        .bind(&row.host_id)
        .bind(&row.status)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn delete_placement(db: &PgPool, lab_id: &str, node_name: &str) -> sqlx::Result<()> {
        sqlx::query(r#"DELETE FROM node_placements WHERE lab_id=$1 AND node_name=$2"#)
            .bind(lab_id)
            .bind(node_name)
            .execute(db)
            .await?;
        Ok(())
    }

    pub async fn states_for_lab(db: &PgPool, lab_id: &str) -> sqlx::Result<Vec<NodeStateRow>> {
        sqlx::query_as::<_, NodeStateRow>(r#"SELECT * FROM node_states WHERE lab_id=$1"#)
            .bind(lab_id)
            .fetch_all(db)
            .await
    }

    pub async fn states_for_nodes(
        db: &PgPool,
        lab_id: &str,
        node_ids: &[Uuid],
    ) -> sqlx::Result<Vec<NodeStateRow>> {
        sqlx::query_as::<_, NodeStateRow>(
            r#"SELECT * FROM node_states WHERE lab_id=$1 AND node_id = ANY($2)"#,
        )
        .bind(lab_id)
        .bind(node_ids)
        .fetch_all(db)
        .await
    }

    pub async fn upsert_state(db: &PgPool, row: &NodeStateRow) -> sqlx::Result<()> {
        sqlx::query(
            r#"INSERT INTO node_states
               (lab_id, node_id, node_name, desired_state, actual_state,
                starting_started_at, stopping_started_at, boot_started_at,
                error_message, is_ready, image_sync_status)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
               ON CONFLICT (lab_id, node_id) DO UPDATE SET
                node_name=$3, desired_state=$4, actual_state=$5,
                starting_started_at=$6, stopping_started_at=$7, boot_started_at=$8,
                error_message=$9, is_ready=$10, image_sync_status=$11"#,
        )
        .bind(&row.lab_id)
        .bind(row.node_id)
        .bind(&row.node_name)
        .bind(&row.desired_state)
        .bind(&row.actual_state)
        .bind(row.starting_started_at)
        .bind(row.stopping_started_at)
        .bind(row.boot_started_at)
        .bind(&row.error_message)
        .bind(row.is_ready)
        .bind(&row.image_sync_status)
        .execute(db)
        .await?;
        Ok(())
    }

    pub async fn all_transitional_states(db: &PgPool) -> sqlx::Result<Vec<NodeStateRow>> {
        sqlx::query_as::<_, NodeStateRow>(
            r#"SELECT * FROM node_states WHERE actual_state IN ('starting','stopping','pending')"#,
        )
        .fetch_all(db)
        .await
    }
}

#[cfg(not(test))]
pub use pg::*;

// =====================================================================
// In-memory test stores (same signatures)
// =====================================================================

#[cfg(test)]
mod mem {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Mutex, OnceLock};

    #[derive(Default)]
    pub struct Store {
        pub labs: HashMap<String, LabRow>,
        pub nodes: Vec<NodeRow>,
        pub links: Vec<LinkRow>,
        pub placements: HashMap<(String, String), NodePlacementRow>,
        pub states: HashMap<(String, Uuid), NodeStateRow>,
    }

    pub fn store() -> &'static Mutex<Store> {
        static STORE: OnceLock<Mutex<Store>> = OnceLock::new();
        STORE.get_or_init(|| Mutex::new(Store::default()))
    }

    pub async fn get_lab(_: &PgPool, id: &str) -> sqlx::Result<Option<LabRow>> {
        Ok(store().lock().unwrap().labs.get(id).cloned())
    }

    pub async fn upsert_lab(_: &PgPool, row: &LabRow) -> sqlx::Result<()> {
        store().lock().unwrap().labs.insert(row.id.clone(), row.clone());
        Ok(())
    }

    pub async fn all_lab_ids(_: &PgPool) -> sqlx::Result<Vec<String>> {
        Ok(store().lock().unwrap().labs.keys().cloned().collect())
    }

    pub async fn nodes_for_lab(_: &PgPool, lab_id: &str) -> sqlx::Result<Vec<NodeRow>> {
        let mut rows: Vec<NodeRow> = store()
            .lock()
            .unwrap()
            .nodes
            .iter()
            .filter(|n| n.lab_id == lab_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    pub async fn insert_node(_: &PgPool, row: &NodeRow) -> sqlx::Result<()> {
        store().lock().unwrap().nodes.push(row.clone());
        Ok(())
    }

    pub async fn update_node(_: &PgPool, row: &NodeRow) -> sqlx::Result<()> {
        let mut guard = store().lock().unwrap();
        if let Some(existing) = guard
            .nodes
            .iter_mut()
            .find(|n| n.lab_id == row.lab_id && n.name == row.name)
        {
            *existing = row.clone();
        }
        Ok(())
    }

    pub async fn links_for_lab(_: &PgPool, lab_id: &str) -> sqlx::Result<Vec<LinkRow>> {
        let mut rows: Vec<LinkRow> = store()
            .lock()
            .unwrap()
            .links
            .iter()
            .filter(|l| l.lab_id == lab_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.link_name.cmp(&b.link_name));
        Ok(rows)
    }

    pub async fn insert_link(_: &PgPool, row: &LinkRow) -> sqlx::Result<()> {
        store().lock().unwrap().links.push(row.clone());
        Ok(())
    }

    pub async fn placements_for_lab(_: &PgPool, lab_id: &str) -> sqlx::Result<Vec<NodePlacementRow>> {
        Ok(store()
            .lock()
            .unwrap()
            .placements
            .values()
            .filter(|p| p.lab_id == lab_id)
            .cloned()
            .collect())
    }

    pub async fn upsert_placement(_: &PgPool, row: &NodePlacementRow) -> sqlx::Result<()> {
        store()
            .lock()
            .unwrap()
            .placements
            .insert((row.lab_id.clone(), row.node_name.clone()), row.clone());
        Ok(())
    }

    pub async fn delete_placement(_: &PgPool, lab_id: &str, node_name: &str) -> sqlx::Result<()> {
        store()
            .lock()
            .unwrap()
            .placements
            .remove(&(lab_id.to_string(), node_name.to_string()));
        Ok(())
    }

    pub async fn states_for_lab(_: &PgPool, lab_id: &str) -> sqlx::Result<Vec<NodeStateRow>> {
        Ok(store()
            .lock()
            .unwrap()
            .states
            .values()
            .filter(|s| s.lab_id == lab_id)
            .cloned()
            .collect())
    }

    pub async fn states_for_nodes(
        _: &PgPool,
        lab_id: &str,
        node_ids: &[Uuid],
    ) -> sqlx::Result<Vec<NodeStateRow>> {
        Ok(store()
            .lock()
            .unwrap()
            .states
            .values()
            .filter(|s| s.lab_id == lab_id && node_ids.contains(&s.node_id))
            .cloned()
            .collect())
    }

    pub async fn upsert_state(_: &PgPool, row: &NodeStateRow) -> sqlx::Result<()> {
        store()
            .lock()
            .unwrap()
            .states
            .insert((row.lab_id.clone(), row.node_id), row.clone());
        Ok(())
    }

    pub async fn all_transitional_states(_: &PgPool) -> sqlx::Result<Vec<NodeStateRow>> {
        Ok(store()
            .lock()
            .unwrap()
            .states
            .values()
            .filter(|s| matches!(s.actual_state.as_str(), "starting" | "stopping" | "pending"))
            .cloned()
            .collect())
    }

    /// Tests share one process-global store; prefer unique lab ids over
    /// resetting, which races parallel tests.
    #[allow(dead_code)]
    pub fn reset_store() {
        let mut guard = store().lock().unwrap();
        *guard = Store::default();
    }
}

#[cfg(test)]
pub use mem::*;
