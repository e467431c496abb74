//! Controller-owned VNI allocation for cross-host links.
//!
//! Agents never choose a VNI; they receive one in the tunnel-create request
//! and validate the range. One row per (lab, link), reused across
//! re-establishments so a flapping link keeps its identifier.

use archetype_types::{VNI_RANGE_END, VNI_RANGE_START};
use sqlx::PgPool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VniRow {
    pub lab_id: String,
    pub link_name: String,
    pub vni: i64,
}

#[cfg(not(test))]
pub async fn existing(db: &PgPool, lab_id: &str, link_name: &str) -> sqlx::Result<Option<i64>> {
    sqlx::query_scalar::<_, i64>(
        r#"SELECT vni FROM vni_allocations WHERE lab_id=$1 AND link_name=$2"#,
    )
    .bind(lab_id)
    .bind(link_name)
    .fetch_optional(db)
    .await
}

#[cfg(not(test))]
pub async fn max_allocated(db: &PgPool) -> sqlx::Result<Option<i64>> {
    sqlx::query_scalar::<_, Option<i64>>(r#"SELECT MAX(vni) FROM vni_allocations"#)
        .fetch_one(db)
        .await
}

#[cfg(not(test))]
pub async fn insert(db: &PgPool, row: &VniRow) -> sqlx::Result<()> {
    sqlx::query(
        r#"INSERT INTO vni_allocations (lab_id, link_name, vni) VALUES ($1,$2,$3)
           ON CONFLICT (lab_id, link_name) DO NOTHING"#,
    )
    .bind(&row.lab_id)
    .bind(&row.link_name)
    .bind(row.vni)
    .execute(db)
    .await?;
    Ok(())
}

#[cfg(test)]
mod mem {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Mutex, OnceLock};

    fn store() -> &'static Mutex<HashMap<(String, String), i64>> {
        static STORE: OnceLock<Mutex<HashMap<(String, String), i64>>> = OnceLock::new();
        STORE.get_or_init(|| Mutex::new(HashMap::new()))
    }

    pub async fn existing(_: &PgPool, lab_id: &str, link_name: &str) -> sqlx::Result<Option<i64>> {
        Ok(store()
            .lock()
            .unwrap()
            .get(&(lab_id.to_string(), link_name.to_string()))
            .copied())
    }

    pub async fn max_allocated(_: &PgPool) -> sqlx::Result<Option<i64>> {
        Ok(store().lock().unwrap().values().max().copied())
    }

    pub async fn insert(_: &PgPool, row: &VniRow) -> sqlx::Result<()> {
        store()
            .lock()
            .unwrap()
            .entry((row.lab_id.clone(), row.link_name.clone()))
            .or_insert(row.vni);
        Ok(())
    }
}

#[cfg(test)]
pub use mem::*;

/// Allocate (or fetch) the VNI for a cross-host link.
pub async fn allocate(db: &PgPool, lab_id: &str, link_name: &str) -> sqlx::Result<u32> {
    if let Some(vni) = existing(db, lab_id, link_name).await? {
        return Ok(vni as u32);
    }
    let next = match max_allocated(db).await? {
        Some(max) if (max as u32) < VNI_RANGE_END => max + 1,
        Some(_) | None => VNI_RANGE_START as i64,
    };
    insert(
        db,
        &VniRow {
            lab_id: lab_id.to_string(),
            link_name: link_name.to_string(),
            vni: next,
        },
    )
    .await?;
    Ok(next as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocation_is_stable_per_link_and_monotonic() {
        let db = PgPool::connect_lazy("postgres://unused").unwrap();
        let first = allocate(&db, "lab-vni", "a:eth1-b:eth1").await.unwrap();
        let again = allocate(&db, "lab-vni", "a:eth1-b:eth1").await.unwrap();
        assert_eq!(first, again);

        let second = allocate(&db, "lab-vni", "a:eth2-b:eth2").await.unwrap();
        assert_ne!(first, second);
        assert!((VNI_RANGE_START..=VNI_RANGE_END).contains(&first));
        assert!((VNI_RANGE_START..=VNI_RANGE_END).contains(&second));
    }
}
