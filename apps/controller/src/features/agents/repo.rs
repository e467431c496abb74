//! Agent registry rows.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

/// Agents missing heartbeats longer than this are unhealthy.
pub const HEARTBEAT_STALE_SECS: i64 = 30;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AgentRow {
    pub id: String,
    pub name: String,
    pub address: String,
    /// JSON array of provider names ("docker", "libvirt").
    pub providers: serde_json::Value,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentRow {
    pub fn is_healthy(&self) -> bool {
        (Utc::now() - self.last_heartbeat).num_seconds() < HEARTBEAT_STALE_SECS
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.providers
            .as_array()
            .map(|list| list.iter().any(|p| p.as_str() == Some(provider)))
            .unwrap_or(false)
    }
}

#[cfg(not(test))]
pub async fn upsert(db: &PgPool, row: &AgentRow) -> sqlx::Result<()> {
    sqlx::query(
        r#"INSERT INTO agents (id, name, address, providers, last_heartbeat)
           VALUES ($1, $2, $3, $4, $5)
           ON CONFLICT (id) DO UPDATE
           SET name=$2, address=$3, providers=$4, last_heartbeat=$5"#,
    )
    .bind(&row.id)
    .bind(&row.name)
    .bind(&row.address)
    .bind(&row.providers)
    .bind(row.last_heartbeat)
    .execute(db)
    .await?;
    Ok(())
}

#[cfg(not(test))]
pub async fn touch_heartbeat(db: &PgPool, id: &str, at: DateTime<Utc>) -> sqlx::Result<()> {
    sqlx::query(r#"UPDATE agents SET last_heartbeat=$2 WHERE id=$1"#)
        .bind(id)
        .bind(at)
        .execute(db)
        .await?;
    Ok(())
}

#[cfg(not(test))]
pub async fn get(db: &PgPool, id: &str) -> sqlx::Result<Option<AgentRow>> {
    sqlx::query_as::<_, AgentRow>(r#"SELECT * FROM agents WHERE id=$1"#)
        .bind(id)
        .fetch_optional(db)
        .await
}

#[cfg(not(test))]
pub async fn list(db: &PgPool) -> sqlx::Result<Vec<AgentRow>> {
    sqlx::query_as::<_, AgentRow>(r#"SELECT * FROM agents ORDER BY name"#)
        .fetch_all(db)
        .await
}

pub async fn list_healthy(db: &PgPool) -> sqlx::Result<Vec<AgentRow>> {
    Ok(list(db).await?.into_iter().filter(|a| a.is_healthy()).collect())
}

// --- test store -------------------------------------------------------

#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

#[cfg(test)]
fn store() -> &'static Mutex<HashMap<String, AgentRow>> {
    static STORE: OnceLock<Mutex<HashMap<String, AgentRow>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(HashMap::new()))
}

#[cfg(test)]
pub async fn upsert(_: &PgPool, row: &AgentRow) -> sqlx::Result<()> {
    store().lock().unwrap().insert(row.id.clone(), row.clone());
    Ok(())
}

#[cfg(test)]
pub async fn touch_heartbeat(_: &PgPool, id: &str, at: DateTime<Utc>) -> sqlx::Result<()> {
    if let Some(row) = store().lock().unwrap().get_mut(id) {
        row.last_heartbeat = at;
    }
    Ok(())
}

#[cfg(test)]
pub async fn get(_: &PgPool, id: &str) -> sqlx::Result<Option<AgentRow>> {
    Ok(store().lock().unwrap().get(id).cloned())
}

#[cfg(test)]
pub async fn list(_: &PgPool) -> sqlx::Result<Vec<AgentRow>> {
    let mut rows: Vec<AgentRow> = store().lock().unwrap().values().cloned().collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(rows)
}

#[cfg(test)]
#[allow(dead_code)]
pub fn reset_store() {
    store().lock().unwrap().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, heartbeat_age_secs: i64) -> AgentRow {
        AgentRow {
            id: id.into(),
            name: id.into(),
            address: format!("http://{id}:8001"),
            providers: serde_json::json!(["docker"]),
            last_heartbeat: Utc::now() - chrono::Duration::seconds(heartbeat_age_secs),
        }
    }

    #[test]
    fn health_follows_heartbeat_age() {
        assert!(agent("a1", 5).is_healthy());
        assert!(!agent("a2", 120).is_healthy());
    }

    #[test]
    fn provider_membership() {
        let a = agent("a3", 0);
        assert!(a.has_provider("docker"));
        assert!(!a.has_provider("libvirt"));
    }
}
