//! Background reconciliation: transitional states that outlive their
//! timeout escalate to error, with the timestamp evidence preserved in the
//! error message.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::features::agents::client::AgentClient;
use crate::features::agents::repo as agents_repo;
use crate::features::labs::repo::{self, NodeStateRow};
use crate::AppState;

const INTERVAL_SECS: u64 = 30;
/// Orphan sweeps are cheap but noisy; run one every N reconcile ticks.
const ORPHAN_SWEEP_EVERY: u64 = 10;
/// Cat9000v readiness runs to 2400 s; give starting nodes comfortably more.
const STARTING_TIMEOUT_SECS: i64 = 3600;
const STOPPING_TIMEOUT_SECS: i64 = 600;
const PENDING_TIMEOUT_SECS: i64 = 900;

pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(INTERVAL_SECS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick: u64 = 0;
        loop {
            ticker.tick().await;
            if let Err(err) = reconcile_once(&state).await {
                error!(error = ?err, "reconciler iteration failed");
            }
            tick += 1;
            if tick % ORPHAN_SWEEP_EVERY == 0 {
                if let Err(err) = sweep_orphans(&state).await {
                    error!(error = ?err, "orphan sweep failed");
                }
            }
        }
    })
}

/// Tell every healthy agent which labs still exist; agents stop containers
/// from labs the controller no longer tracks.
async fn sweep_orphans(state: &AppState) -> Result<()> {
    let valid = repo::all_lab_ids(&state.db).await?;
    for agent in agents_repo::list_healthy(&state.db).await? {
        let client = AgentClient::new(&agent.address, &state.secret, state.agent_timeout_secs);
        match client.cleanup_orphans(&valid).await {
            Ok(result) => {
                let stopped = result
                    .get("stopped")
                    .and_then(|v| v.as_array())
                    .map(|a| a.len())
                    .unwrap_or(0);
                if stopped > 0 {
                    info!(agent_id = %agent.id, stopped, "agent stopped orphan containers");
                    metrics::counter!("controller_orphan_containers_stopped", stopped as u64);
                }
            }
            Err(err) => {
                tracing::warn!(agent_id = %agent.id, error = %err, "orphan sweep call failed");
            }
        }
    }
    Ok(())
}

/// Which transitional states have overstayed, and why.
pub fn stale_reason(state: &NodeStateRow, now: chrono::DateTime<chrono::Utc>) -> Option<String> {
    let age_of = |stamp: Option<chrono::DateTime<chrono::Utc>>| {
        stamp.map(|at| (now - at).num_seconds()).unwrap_or(i64::MAX)
    };
    match state.actual_state.as_str() {
        "starting" => {
            let age = age_of(state.starting_started_at);
            (age > STARTING_TIMEOUT_SECS)
                .then(|| format!("node stuck starting for {age}s (limit {STARTING_TIMEOUT_SECS}s)"))
        }
        "stopping" => {
            let age = age_of(state.stopping_started_at);
            (age > STOPPING_TIMEOUT_SECS)
                .then(|| format!("node stuck stopping for {age}s (limit {STOPPING_TIMEOUT_SECS}s)"))
        }
        "pending" => {
            let age = age_of(state.starting_started_at.or(state.boot_started_at));
            (age > PENDING_TIMEOUT_SECS)
                .then(|| format!("node stuck pending for {age}s (limit {PENDING_TIMEOUT_SECS}s)"))
        }
        _ => None,
    }
}

async fn reconcile_once(state: &AppState) -> Result<()> {
    let transitional = repo::all_transitional_states(&state.db).await?;
    let now = Utc::now();
    for mut node_state in transitional {
        let Some(reason) = stale_reason(&node_state, now) else {
            continue;
        };
        info!(
            lab_id = %node_state.lab_id,
            node = %node_state.node_name,
            state = %node_state.actual_state,
            "escalating stale transitional state to error"
        );
        metrics::counter!("controller_reconciler_stale_escalations", 1);
        node_state.actual_state = "error".into();
        node_state.error_message = Some(reason);
        repo::upsert_state(&state.db, &node_state).await?;
        let _ = state.ws.send(
            serde_json::json!({
                "type": "node-state",
                "lab_id": node_state.lab_id,
                "node": node_state.node_name,
                "actual_state": "error",
                "error": node_state.error_message,
            })
            .to_string(),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn state(actual: &str, started_secs_ago: i64) -> NodeStateRow {
        let stamp = Utc::now() - chrono::Duration::seconds(started_secs_ago);
        NodeStateRow {
            lab_id: "lab-rec".into(),
            node_id: Uuid::new_v4(),
            node_name: "r1".into(),
            desired_state: "running".into(),
            actual_state: actual.into(),
            starting_started_at: Some(stamp),
            stopping_started_at: Some(stamp),
            boot_started_at: Some(stamp),
            error_message: None,
            is_ready: false,
            image_sync_status: None,
        }
    }

    #[test]
    fn fresh_transitional_states_are_left_alone() {
        let now = Utc::now();
        assert!(stale_reason(&state("starting", 60), now).is_none());
        assert!(stale_reason(&state("stopping", 60), now).is_none());
        assert!(stale_reason(&state("pending", 60), now).is_none());
    }

    #[test]
    fn overstayed_states_escalate_with_evidence() {
        let now = Utc::now();
        let reason = stale_reason(&state("starting", STARTING_TIMEOUT_SECS + 10), now).unwrap();
        assert!(reason.contains("stuck starting"));
        assert!(stale_reason(&state("stopping", STOPPING_TIMEOUT_SECS + 10), now).is_some());
        assert!(stale_reason(&state("pending", PENDING_TIMEOUT_SECS + 10), now).is_some());
    }

    #[test]
    fn settled_states_never_escalate() {
        let now = Utc::now();
        for actual in ["running", "stopped", "error", "undeployed", "exited"] {
            assert!(stale_reason(&state(actual, 100_000), now).is_none());
        }
    }

    #[test]
    fn missing_timestamp_counts_as_stale() {
        let mut row = state("starting", 0);
        row.starting_started_at = None;
        assert!(stale_reason(&row, Utc::now()).is_some());
    }
}
