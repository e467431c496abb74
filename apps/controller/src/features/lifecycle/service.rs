//! Per-node deploy/start/stop orchestration across agents.
//!
//! The ordering here is the contract: transitional states are written
//! before any RPC so the UI reflects intent even when an agent is
//! unreachable; capacity is checked before a migration touches the old
//! host; placements are created before deploy starts; cross-host links are
//! established only after both endpoints run.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};
use archetype_types::{
    AgentErrorKind, CapacityRequest, DeployRequest, DesiredState, LinkEndpoint, NodeStatus,
    TunnelCreateRequest,
};
use chrono::Utc;
use uuid::Uuid;

use crate::features::agents::client::{AgentCallError, AgentClient};
use crate::features::agents::repo::{self as agents_repo, AgentRow};
use crate::features::labs::repo::{
    self as labs_repo, LabRow, LinkRow, NodePlacementRow, NodeRow, NodeStateRow,
};
use crate::AppState;

use super::filter::filter_topology_for_agent;
use super::transitions::{transition, TransitionAction};
use super::vni;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct LifecycleResult {
    pub success: bool,
    pub message: String,
    /// node name -> final actual_state.
    pub node_results: HashMap<String, String>,
}

impl LifecycleResult {
    pub fn noop() -> Self {
        Self {
            success: true,
            message: "nothing to do".into(),
            node_results: HashMap::new(),
        }
    }
}

pub struct NodeLifecycleManager {
    st: AppState,
    job_id: Uuid,
    lab: LabRow,
    node_ids: Vec<Uuid>,

    nodes_by_name: HashMap<String, NodeRow>,
    links: Vec<LinkRow>,
    placements: HashMap<String, NodePlacementRow>,
    states: Vec<NodeStateRow>,
    agents: HashMap<String, AgentRow>,
    /// node name -> resolved agent id.
    resolved: HashMap<String, String>,

    deploy_set: Vec<String>,
    start_set: Vec<String>,
    stop_set: Vec<String>,
}

impl NodeLifecycleManager {
    pub fn new(st: AppState, lab: LabRow, job_id: Uuid, node_ids: Vec<Uuid>) -> Self {
        Self {
            st,
            job_id,
            lab,
            node_ids,
            nodes_by_name: HashMap::new(),
            links: Vec::new(),
            placements: HashMap::new(),
            states: Vec::new(),
            agents: HashMap::new(),
            resolved: HashMap::new(),
            deploy_set: Vec::new(),
            start_set: Vec::new(),
            stop_set: Vec::new(),
        }
    }

    fn client_for(&self, agent: &AgentRow) -> AgentClient {
        AgentClient::new(&agent.address, &self.st.secret, self.st.agent_timeout_secs)
    }

    fn agent_ip(agent: &AgentRow) -> String {
        agent
            .address
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .split(':')
            .next()
            .unwrap_or("")
            .to_string()
    }

    fn state_for_mut(&mut self, node_name: &str) -> Option<&mut NodeStateRow> {
        self.states.iter_mut().find(|s| s.node_name == node_name)
    }

    async fn write_state(&self, state: &NodeStateRow) {
        if let Err(err) = labs_repo::upsert_state(&self.st.db, state).await {
            tracing::error!(node = %state.node_name, error = %err, "failed to persist node state");
        }
    }

    async fn set_actual(&mut self, node_name: &str, actual: NodeStatus, message: Option<String>) {
        let now = Utc::now();
        let Some(state) = self.state_for_mut(node_name) else {
            return;
        };
        state.actual_state = actual.as_str().to_string();
        state.error_message = message;
        match actual {
            NodeStatus::Starting => {
                state.starting_started_at = Some(now);
                state.boot_started_at = Some(now);
            }
            NodeStatus::Stopping => state.stopping_started_at = Some(now),
            NodeStatus::Running => state.is_ready = false,
            _ => {}
        }
        let snapshot = state.clone();
        self.write_state(&snapshot).await;
        self.broadcast(&snapshot);
    }

    fn broadcast(&self, state: &NodeStateRow) {
        // Fire-and-forget after the row is committed.
        let _ = self.st.ws.send(
            serde_json::json!({
                "type": "node-state",
                "job_id": self.job_id,
                "lab_id": state.lab_id,
                "node": state.node_name,
                "actual_state": state.actual_state,
                "error": state.error_message,
            })
            .to_string(),
        );
    }

    // -----------------------------------------------------------------
    // Phase 1: load & validate
    // -----------------------------------------------------------------

    async fn load_and_validate(&mut self) -> Result<bool> {
        let nodes = labs_repo::nodes_for_lab(&self.st.db, &self.lab.id).await?;
        self.links = labs_repo::links_for_lab(&self.st.db, &self.lab.id).await?;
        self.placements = labs_repo::placements_for_lab(&self.st.db, &self.lab.id)
            .await?
            .into_iter()
            .map(|p| (p.node_name.clone(), p))
            .collect();
        self.states = labs_repo::states_for_nodes(&self.st.db, &self.lab.id, &self.node_ids).await?;

        let nodes_by_id: HashMap<Uuid, &NodeRow> = nodes.iter().map(|n| (n.id, n)).collect();
        // Repair node_name placeholders left by lazy state creation.
        for state in &mut self.states {
            if state.node_name.is_empty() {
                if let Some(node) = nodes_by_id.get(&state.node_id) {
                    state.node_name = node.name.clone();
                    labs_repo::upsert_state(&self.st.db, state).await?;
                }
            }
        }
        self.nodes_by_name = nodes.into_iter().map(|n| (n.name.clone(), n)).collect();

        for agent in agents_repo::list(&self.st.db).await? {
            self.agents.insert(agent.id.clone(), agent);
        }

        let actionable = self.states.iter().any(|state| {
            transition(state.actual(), state.desired()) != TransitionAction::None
        });
        Ok(actionable)
    }

    // -----------------------------------------------------------------
    // Phase 2: transitional states before any RPC
    // -----------------------------------------------------------------

    async fn set_transitional_states(&mut self) {
        let planned: Vec<(String, NodeStatus)> = self
            .states
            .iter()
            .filter_map(|state| {
                let action = transition(state.actual(), state.desired());
                let transitional = match action {
                    TransitionAction::Deploy => NodeStatus::Pending,
                    TransitionAction::Start | TransitionAction::Restart => NodeStatus::Starting,
                    TransitionAction::Stop | TransitionAction::ReverseStart => NodeStatus::Stopping,
                    TransitionAction::MarkStopped | TransitionAction::None => return None,
                };
                Some((state.node_name.clone(), transitional))
            })
            .collect();
        for (node_name, status) in planned {
            self.set_actual(&node_name, status, None).await;
        }
    }

    // -----------------------------------------------------------------
    // Phase 3: agent resolution
    // -----------------------------------------------------------------

    /// Priority: explicit Node.host_id (fail-fast when down) > existing
    /// placement > lab default agent > any healthy agent with the provider.
    async fn resolve_agents(&mut self) -> Result<()> {
        let mut errors: Vec<(String, String)> = Vec::new();
        let names: Vec<String> = self.states.iter().map(|s| s.node_name.clone()).collect();

        for node_name in names {
            let Some(node) = self.nodes_by_name.get(&node_name) else {
                errors.push((node_name, "node row missing".into()));
                continue;
            };
            let provider = if node.image.ends_with(".qcow2") {
                "libvirt"
            } else {
                "docker"
            };

            if let Some(host_id) = &node.host_id {
                match self.agents.get(host_id) {
                    Some(agent) if agent.is_healthy() => {
                        self.resolved.insert(node_name, host_id.clone());
                    }
                    Some(_) | None => {
                        errors.push((
                            node_name,
                            format!("pinned host {host_id} is unavailable"),
                        ));
                    }
                }
                continue;
            }

            if let Some(placement) = self.placements.get(&node_name) {
                if self
                    .agents
                    .get(&placement.host_id)
                    .map(|a| a.is_healthy())
                    .unwrap_or(false)
                {
                    self.resolved.insert(node_name, placement.host_id.clone());
                    continue;
                }
            }

            if let Some(agent_id) = &self.lab.agent_id {
                if self
                    .agents
                    .get(agent_id)
                    .map(|a| a.is_healthy() && a.has_provider(provider))
                    .unwrap_or(false)
                {
                    self.resolved.insert(node_name, agent_id.clone());
                    continue;
                }
            }

            let fallback = self
                .agents
                .values()
                .filter(|a| a.is_healthy() && a.has_provider(provider))
                .map(|a| a.id.clone())
                .min();
            match fallback {
                Some(agent_id) => {
                    self.resolved.insert(node_name, agent_id);
                }
                None => errors.push((
                    node_name,
                    format!("no healthy agent provides {provider}"),
                )),
            }
        }

        for (node_name, message) in errors {
            self.set_actual(&node_name, NodeStatus::Error, Some(message)).await;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Phase 5: categorize (uses the transition table)
    // -----------------------------------------------------------------

    async fn categorize(&mut self) {
        let mut mark_stopped = Vec::new();
        for state in &self.states {
            if state.actual_state == "error" && state.error_message.is_some() {
                // Already failed in an earlier phase this run.
                if !self.resolved.contains_key(&state.node_name) {
                    continue;
                }
            }
            // The transitional write in phase 2 replaced the original
            // actual state; recover the intended action from the
            // transitional value + desire.
            match (state.actual_state.as_str(), state.desired()) {
                ("pending", DesiredState::Running) => self.deploy_set.push(state.node_name.clone()),
                ("starting", DesiredState::Running) => self.start_set.push(state.node_name.clone()),
                ("stopping", _) => self.stop_set.push(state.node_name.clone()),
                ("pending", DesiredState::Stopped) => mark_stopped.push(state.node_name.clone()),
                _ => {}
            }
        }
        for node_name in mark_stopped {
            self.set_actual(&node_name, NodeStatus::Stopped, None).await;
        }
    }

    // -----------------------------------------------------------------
    // Phase 4: capacity check before migrations/deploys
    // -----------------------------------------------------------------

    async fn check_resources(&mut self) {
        // Group deploy candidates per resolved agent.
        let mut per_agent: HashMap<String, Vec<String>> = HashMap::new();
        for node_name in &self.deploy_set {
            if let Some(agent_id) = self.resolved.get(node_name) {
                per_agent
                    .entry(agent_id.clone())
                    .or_default()
                    .push(node_name.clone());
            }
        }

        let mut rejected: Vec<(String, String)> = Vec::new();
        for (agent_id, node_names) in per_agent {
            let Some(agent) = self.agents.get(&agent_id) else {
                continue;
            };
            let kinds: Vec<String> = node_names
                .iter()
                .filter_map(|name| self.nodes_by_name.get(name))
                .map(|node| node.kind.clone())
                .collect();
            let client = self.client_for(agent);
            match client.capacity(&CapacityRequest { device_kinds: kinds }).await {
                Ok(capacity) if !capacity.sufficient => {
                    for node_name in node_names {
                        rejected.push((
                            node_name,
                            format!(
                                "agent {agent_id} lacks capacity ({} cpus / {} MB needed, {} / {} available)",
                                capacity.required_cpus,
                                capacity.required_mem_mb,
                                capacity.available_cpus,
                                capacity.available_mem_mb
                            ),
                        ));
                    }
                }
                Ok(_) => {}
                Err(AgentCallError::Unavailable(message)) => {
                    tracing::warn!(agent_id, %message, "capacity check unreachable, proceeding optimistically");
                }
                Err(AgentCallError::Rejected(message)) => {
                    tracing::warn!(agent_id, %message, "capacity check rejected, proceeding");
                }
            }
        }

        for (node_name, message) in rejected {
            // Old-host containers are untouched by design.
            self.deploy_set.retain(|n| n != &node_name);
            self.resolved.remove(&node_name);
            self.set_actual(&node_name, NodeStatus::Error, Some(message)).await;
        }
    }

    // -----------------------------------------------------------------
    // Phase 6: migration
    // -----------------------------------------------------------------

    async fn handle_migration(&mut self) {
        let moves: Vec<(String, String, String)> = self
            .deploy_set
            .iter()
            .chain(self.start_set.iter())
            .filter_map(|node_name| {
                let new_agent = self.resolved.get(node_name)?;
                let placement = self.placements.get(node_name)?;
                if &placement.host_id != new_agent {
                    Some((node_name.clone(), placement.host_id.clone(), new_agent.clone()))
                } else {
                    None
                }
            })
            .collect();

        for (node_name, old_agent_id, new_agent_id) in moves {
            tracing::info!(
                lab_id = %self.lab.id,
                node = %node_name,
                from = %old_agent_id,
                to = %new_agent_id,
                "migrating node"
            );
            metrics::counter!("controller_node_migrations", 1);
            if let Some(old_agent) = self.agents.get(&old_agent_id) {
                let client = self.client_for(old_agent);
                if let Err(err) = client.stop_node(&self.lab.id, &node_name).await {
                    tracing::warn!(node = %node_name, error = %err, "old-host stop failed during migration");
                }
            }
            let _ = labs_repo::delete_placement(&self.st.db, &self.lab.id, &node_name).await;
            self.placements.remove(&node_name);
        }

        // Placements are recorded before deploy so a crash mid-deploy
        // leaves a trail pointing at the right host.
        let new_placements: Vec<NodePlacementRow> = self
            .deploy_set
            .iter()
            .filter_map(|node_name| {
                let agent_id = self.resolved.get(node_name)?;
                Some(NodePlacementRow {
                    lab_id: self.lab.id.clone(),
                    node_name: node_name.clone(),
                    host_id: agent_id.clone(),
                    status: "starting".into(),
                })
            })
            .collect();
        for placement in new_placements {
            if let Err(err) = labs_repo::upsert_placement(&self.st.db, &placement).await {
                tracing::error!(node = %placement.node_name, error = %err, "failed to record placement");
            }
            self.placements
                .insert(placement.node_name.clone(), placement);
        }
    }

    // -----------------------------------------------------------------
    // Phase 7: image availability gate
    // -----------------------------------------------------------------

    async fn check_images(&mut self) {
        if !self.st.image_sync_enabled {
            return;
        }
        let mut per_agent: HashMap<String, Vec<String>> = HashMap::new();
        for node_name in &self.deploy_set {
            if let Some(agent_id) = self.resolved.get(node_name) {
                per_agent
                    .entry(agent_id.clone())
                    .or_default()
                    .push(node_name.clone());
            }
        }

        let mut excluded: Vec<(String, NodeStatus, Option<String>, Option<String>)> = Vec::new();
        for (agent_id, node_names) in per_agent {
            let Some(agent) = self.agents.get(&agent_id) else {
                continue;
            };
            let images: Vec<String> = node_names
                .iter()
                .filter_map(|name| self.nodes_by_name.get(name))
                .map(|node| node.image.clone())
                .collect();
            let client = self.client_for(agent);
            let check = match client.check_images(&images).await {
                Ok(check) => check,
                Err(err) => {
                    tracing::warn!(agent_id, error = %err, "image check failed, deferring to deploy validation");
                    continue;
                }
            };
            for node_name in node_names {
                let Some(node) = self.nodes_by_name.get(&node_name) else {
                    continue;
                };
                if check.syncing.contains(&node.image) {
                    excluded.push((
                        node_name,
                        NodeStatus::Starting,
                        None,
                        Some("syncing".to_string()),
                    ));
                } else if check.missing.contains(&node.image) {
                    excluded.push((
                        node_name,
                        NodeStatus::Error,
                        Some(format!("image {} not available on {agent_id}", node.image)),
                        None,
                    ));
                }
            }
        }

        for (node_name, status, message, sync_status) in excluded {
            self.deploy_set.retain(|n| n != &node_name);
            self.set_actual(&node_name, status, message).await;
            if let Some(sync_status) = sync_status {
                if let Some(state) = self.state_for_mut(&node_name) {
                    state.image_sync_status = Some(sync_status);
                    let snapshot = state.clone();
                    self.write_state(&snapshot).await;
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Phase 8: deploy (whole-topology path per agent)
    // -----------------------------------------------------------------

    async fn deploy_nodes(&mut self) {
        let mut per_agent: HashMap<String, Vec<String>> = HashMap::new();
        for node_name in &self.deploy_set {
            if let Some(agent_id) = self.resolved.get(node_name) {
                per_agent
                    .entry(agent_id.clone())
                    .or_default()
                    .push(node_name.clone());
            }
        }

        let nodes: Vec<NodeRow> = self.nodes_by_name.values().cloned().collect();
        let existing_placements: HashMap<String, String> = self
            .placements
            .iter()
            .map(|(name, p)| (name.clone(), p.host_id.clone()))
            .collect();

        for (agent_id, node_names) in per_agent {
            let Some(agent) = self.agents.get(&agent_id).cloned() else {
                continue;
            };
            let topology = filter_topology_for_agent(
                &self.lab.id,
                &nodes,
                &self.links,
                &self.resolved,
                &existing_placements,
                &agent_id,
            );
            let client = self.client_for(&agent);
            let request = DeployRequest {
                lab_id: self.lab.id.clone(),
                topology,
                provider: None,
            };
            match client.deploy(&request).await {
                Ok(response) if response.success => {
                    let reported: HashMap<String, NodeStatus> = response
                        .nodes
                        .iter()
                        .map(|n| (n.name.clone(), n.status))
                        .collect();
                    for node_name in node_names {
                        let status = reported
                            .get(&node_name)
                            .copied()
                            .unwrap_or(NodeStatus::Starting);
                        self.set_actual(&node_name, status, None).await;
                    }
                }
                Ok(response) => {
                    // Structured failure: missing images name every node at
                    // once so the user can fix them all in one pass.
                    let missing: HashSet<String> = response
                        .missing_images
                        .iter()
                        .map(|m| m.node.clone())
                        .collect();
                    for node_name in node_names {
                        let message = if missing.contains(&node_name) {
                            let image = response
                                .missing_images
                                .iter()
                                .find(|m| m.node == node_name)
                                .map(|m| m.image.clone())
                                .unwrap_or_default();
                            format!("image {image} missing on {agent_id}")
                        } else if response.error_kind == Some(AgentErrorKind::MissingImage) {
                            continue;
                        } else {
                            response.error.clone().unwrap_or_else(|| "deploy failed".into())
                        };
                        self.set_actual(&node_name, NodeStatus::Error, Some(message)).await;
                    }
                }
                Err(AgentCallError::Unavailable(message)) => {
                    // Transient: stay pending; reconciliation retries.
                    for node_name in node_names {
                        if let Some(state) = self.state_for_mut(&node_name) {
                            state.error_message = Some(format!("agent unavailable: {message}"));
                            let snapshot = state.clone();
                            self.write_state(&snapshot).await;
                        }
                    }
                }
                Err(AgentCallError::Rejected(message)) => {
                    for node_name in node_names {
                        self.set_actual(&node_name, NodeStatus::Error, Some(message.clone()))
                            .await;
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Phase 8b: start existing nodes
    // -----------------------------------------------------------------

    async fn start_nodes(&mut self) {
        let starts: Vec<(String, String)> = self
            .start_set
            .iter()
            .filter_map(|node_name| {
                self.resolved
                    .get(node_name)
                    .map(|agent_id| (node_name.clone(), agent_id.clone()))
            })
            .collect();

        for (node_name, agent_id) in starts {
            let Some(agent) = self.agents.get(&agent_id).cloned() else {
                continue;
            };
            let Some(node) = self.nodes_by_name.get(&node_name).cloned() else {
                continue;
            };
            let spec = archetype_types::TopologyNodeSpec {
                name: node.name.clone(),
                display_name: node.display_name.clone(),
                kind: node.kind.clone(),
                image: node.image.clone(),
                startup_config: node.startup_config.clone(),
                interface_count: node.interface_count.map(|c| c.max(0) as u32),
                host_id: node.host_id.clone(),
            };
            let links: Vec<archetype_types::TopologyLinkSpec> = self
                .links
                .iter()
                .filter(|l| l.source_node == node_name || l.target_node == node_name)
                .map(|l| archetype_types::TopologyLinkSpec {
                    endpoints: [
                        LinkEndpoint::new(&l.source_node, &l.source_interface),
                        LinkEndpoint::new(&l.target_node, &l.target_interface),
                    ],
                    link_id: Some(l.link_name.clone()),
                })
                .collect();

            let client = self.client_for(&agent);
            match client.start_node(&self.lab.id, &node_name, &spec, &links).await {
                Ok(response) if response.success => {
                    self.set_actual(&node_name, NodeStatus::Running, None).await;
                }
                Ok(response) => {
                    self.set_actual(&node_name, NodeStatus::Error, response.error).await;
                }
                Err(AgentCallError::Unavailable(message)) => {
                    if let Some(state) = self.state_for_mut(&node_name) {
                        state.error_message = Some(format!("agent unavailable: {message}"));
                        let snapshot = state.clone();
                        self.write_state(&snapshot).await;
                    }
                }
                Err(AgentCallError::Rejected(message)) => {
                    self.set_actual(&node_name, NodeStatus::Error, Some(message)).await;
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Phase 9: stop, batched by the host actually recorded in placements
    // -----------------------------------------------------------------

    async fn stop_nodes(&mut self) {
        let mut per_host: HashMap<String, Vec<String>> = HashMap::new();
        for node_name in &self.stop_set {
            let host = self
                .placements
                .get(node_name)
                .map(|p| p.host_id.clone())
                .or_else(|| self.lab.agent_id.clone());
            if let Some(host) = host {
                per_host.entry(host).or_default().push(node_name.clone());
            } else {
                per_host
                    .entry(String::new())
                    .or_default()
                    .push(node_name.clone());
            }
        }

        let mut not_found: Vec<String> = Vec::new();
        for (host_id, node_names) in per_host {
            let agent = if host_id.is_empty() {
                None
            } else {
                self.agents.get(&host_id).cloned()
            };
            let Some(agent) = agent else {
                // No recorded host: try the default agent pass below.
                not_found.extend(node_names);
                continue;
            };
            let client = self.client_for(&agent);
            for node_name in node_names {
                match client.stop_node(&self.lab.id, &node_name).await {
                    Ok(response) if response.success => {
                        self.set_actual(&node_name, NodeStatus::Stopped, None).await;
                    }
                    Ok(response) => {
                        let message = response.error.unwrap_or_default();
                        if message.contains("not found") || message.contains("No such") {
                            not_found.push(node_name);
                        } else {
                            self.set_actual(&node_name, NodeStatus::Error, Some(message)).await;
                        }
                    }
                    Err(AgentCallError::Unavailable(message)) => {
                        if let Some(state) = self.state_for_mut(&node_name) {
                            state.error_message = Some(format!("agent unavailable: {message}"));
                            let snapshot = state.clone();
                            self.write_state(&snapshot).await;
                        }
                    }
                    Err(AgentCallError::Rejected(message)) => {
                        self.set_actual(&node_name, NodeStatus::Error, Some(message)).await;
                    }
                }
            }
        }

        // One retry for strays on the lab's default agent.
        if !not_found.is_empty() {
            let default_agent = self
                .lab
                .agent_id
                .as_ref()
                .and_then(|id| self.agents.get(id))
                .cloned();
            for node_name in not_found {
                if let Some(agent) = &default_agent {
                    let client = self.client_for(agent);
                    if let Ok(response) = client.stop_node(&self.lab.id, &node_name).await {
                        if response.success {
                            self.set_actual(&node_name, NodeStatus::Stopped, None).await;
                            continue;
                        }
                    }
                }
                // Nothing to stop anywhere: it is stopped.
                self.set_actual(&node_name, NodeStatus::Stopped, None).await;
            }
        }
    }

    // -----------------------------------------------------------------
    // Phase 10: cross-host links
    // -----------------------------------------------------------------

    async fn establish_cross_host_links(&mut self) {
        let running: HashSet<String> = self
            .states
            .iter()
            .filter(|s| s.actual_state == "running")
            .map(|s| s.node_name.clone())
            .collect();

        let candidates: Vec<LinkRow> = self
            .links
            .iter()
            .filter(|link| {
                let source_agent = self.placements.get(&link.source_node).map(|p| &p.host_id);
                let target_agent = self.placements.get(&link.target_node).map(|p| &p.host_id);
                match (source_agent, target_agent) {
                    (Some(a), Some(b)) if a != b => {
                        running.contains(&link.source_node) && running.contains(&link.target_node)
                    }
                    _ => false,
                }
            })
            .cloned()
            .collect();

        for link in candidates {
            if let Err(err) = self.establish_one_cross_host_link(&link).await {
                tracing::warn!(link = %link.link_name, error = %err, "cross-host link establishment failed");
                metrics::counter!("controller_cross_host_link_failures", 1);
            }
        }
    }

    async fn establish_one_cross_host_link(&self, link: &LinkRow) -> Result<()> {
        let source_host = self
            .placements
            .get(&link.source_node)
            .ok_or_else(|| anyhow!("no placement for {}", link.source_node))?;
        let target_host = self
            .placements
            .get(&link.target_node)
            .ok_or_else(|| anyhow!("no placement for {}", link.target_node))?;
        let source_agent = self
            .agents
            .get(&source_host.host_id)
            .ok_or_else(|| anyhow!("unknown agent {}", source_host.host_id))?;
        let target_agent = self
            .agents
            .get(&target_host.host_id)
            .ok_or_else(|| anyhow!("unknown agent {}", target_host.host_id))?;

        let vni = vni::allocate(&self.st.db, &self.lab.id, &link.link_name).await?;

        // Each side trunks the tunnel with its local endpoint's VLAN; the
        // tag is stripped on egress so the sides need not agree on a value.
        for (agent, node, interface, peer) in [
            (
                source_agent,
                &link.source_node,
                &link.source_interface,
                target_agent,
            ),
            (
                target_agent,
                &link.target_node,
                &link.target_interface,
                source_agent,
            ),
        ] {
            let client = self.client_for(agent);
            let vlan = client
                .endpoint_vlan(&self.lab.id, node, interface)
                .await
                .map_err(|err| anyhow!("vlan lookup for {node}:{interface} failed: {err}"))?;
            let request = TunnelCreateRequest {
                lab_id: self.lab.id.clone(),
                link_id: link.link_name.clone(),
                vni,
                vlan_tag: vlan,
                local_ip: String::new(),
                remote_ip: Self::agent_ip(peer),
            };
            let response = client
                .create_tunnel(&request)
                .await
                .map_err(|err| anyhow!("tunnel create on {} failed: {err}", agent.id))?;
            if response.get("success").and_then(|v| v.as_bool()) != Some(true) {
                return Err(anyhow!(
                    "tunnel create on {} rejected: {}",
                    agent.id,
                    response
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                ));
            }
        }
        tracing::info!(link = %link.link_name, vni, "established cross-host link");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Phase 11: finalize
    // -----------------------------------------------------------------

    fn finalize(&self) -> LifecycleResult {
        let mut node_results = HashMap::new();
        let mut failed = 0usize;
        for state in &self.states {
            if state.actual_state == "error" {
                failed += 1;
            }
            node_results.insert(state.node_name.clone(), state.actual_state.clone());
        }
        let success = failed == 0;
        let message = if success {
            format!("{} nodes reconciled", self.states.len())
        } else {
            format!("{failed} of {} nodes failed", self.states.len())
        };
        let _ = self.st.ws.send(
            serde_json::json!({
                "type": "job-progress",
                "job_id": self.job_id,
                "lab_id": self.lab.id,
                "success": success,
                "message": message,
            })
            .to_string(),
        );
        LifecycleResult {
            success,
            message,
            node_results,
        }
    }

    // -----------------------------------------------------------------
    // Entry point
    // -----------------------------------------------------------------

    pub async fn execute(mut self) -> Result<LifecycleResult> {
        if !self.load_and_validate().await? {
            return Ok(LifecycleResult::noop());
        }
        self.set_transitional_states().await;
        self.resolve_agents().await?;
        self.categorize().await;
        self.check_resources().await;
        self.handle_migration().await;
        self.check_images().await;
        self.deploy_nodes().await;
        self.start_nodes().await;
        self.stop_nodes().await;
        self.establish_cross_host_links().await;
        Ok(self.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_state(lab: &str, node: &str, desired: &str, actual: &str) -> NodeStateRow {
        NodeStateRow {
            lab_id: lab.into(),
            node_id: Uuid::new_v4(),
            node_name: node.into(),
            desired_state: desired.into(),
            actual_state: actual.into(),
            starting_started_at: None,
            stopping_started_at: None,
            boot_started_at: None,
            error_message: None,
            is_ready: false,
            image_sync_status: None,
        }
    }

    fn app_state() -> AppState {
        let (ws, _) = tokio::sync::broadcast::channel(16);
        AppState {
            db: sqlx::PgPool::connect_lazy("postgres://unused").unwrap(),
            ws,
            secret: String::new(),
            agent_timeout_secs: 1,
            image_sync_enabled: false,
        }
    }

    async fn seed_lab(st: &AppState, lab_id: &str) -> (LabRow, Vec<Uuid>) {
        let lab = LabRow {
            id: lab_id.into(),
            name: lab_id.into(),
            agent_id: None,
        };
        labs_repo::upsert_lab(&st.db, &lab).await.unwrap();
        let node = NodeRow {
            id: Uuid::new_v4(),
            lab_id: lab_id.into(),
            name: "r1".into(),
            display_name: None,
            kind: "linux".into(),
            image: "alpine".into(),
            host_id: None,
            interface_count: None,
            startup_config: None,
        };
        labs_repo::insert_node(&st.db, &node).await.unwrap();
        let mut state = mk_state(lab_id, "r1", "running", "undeployed");
        state.node_id = node.id;
        labs_repo::upsert_state(&st.db, &state).await.unwrap();
        (lab, vec![node.id])
    }

    #[tokio::test]
    async fn no_agents_means_error_not_crash() {
        let st = app_state();
        let (lab, node_ids) = seed_lab(&st, "lab-lc-1").await;
        let manager = NodeLifecycleManager::new(st.clone(), lab, Uuid::new_v4(), node_ids.clone());
        let result = manager.execute().await.unwrap();
        assert!(!result.success);

        let states = labs_repo::states_for_nodes(&st.db, "lab-lc-1", &node_ids)
            .await
            .unwrap();
        assert_eq!(states[0].actual_state, "error");
        assert!(states[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("no healthy agent"));
    }

    #[tokio::test]
    async fn settled_lab_is_a_noop() {
        let st = app_state();
        let lab = LabRow {
            id: "lab-lc-2".into(),
            name: "lab-lc-2".into(),
            agent_id: None,
        };
        labs_repo::upsert_lab(&st.db, &lab).await.unwrap();
        let node = NodeRow {
            id: Uuid::new_v4(),
            lab_id: "lab-lc-2".into(),
            name: "r1".into(),
            display_name: None,
            kind: "linux".into(),
            image: "alpine".into(),
            host_id: None,
            interface_count: None,
            startup_config: None,
        };
        labs_repo::insert_node(&st.db, &node).await.unwrap();
        let mut state = mk_state("lab-lc-2", "r1", "running", "running");
        state.node_id = node.id;
        labs_repo::upsert_state(&st.db, &state).await.unwrap();

        let manager =
            NodeLifecycleManager::new(st.clone(), lab, Uuid::new_v4(), vec![node.id]);
        let result = manager.execute().await.unwrap();
        assert!(result.success);
        assert_eq!(result.message, "nothing to do");
    }

    #[tokio::test]
    async fn desired_stopped_on_undeployed_marks_stopped_without_rpc() {
        let st = app_state();
        let lab = LabRow {
            id: "lab-lc-3".into(),
            name: "lab-lc-3".into(),
            agent_id: None,
        };
        labs_repo::upsert_lab(&st.db, &lab).await.unwrap();
        let node = NodeRow {
            id: Uuid::new_v4(),
            lab_id: "lab-lc-3".into(),
            name: "r1".into(),
            display_name: None,
            kind: "linux".into(),
            image: "alpine".into(),
            host_id: None,
            interface_count: None,
            startup_config: None,
        };
        labs_repo::insert_node(&st.db, &node).await.unwrap();
        let mut state = mk_state("lab-lc-3", "r1", "stopped", "undeployed");
        state.node_id = node.id;
        labs_repo::upsert_state(&st.db, &state).await.unwrap();

        let manager =
            NodeLifecycleManager::new(st.clone(), lab, Uuid::new_v4(), vec![node.id]);
        let result = manager.execute().await.unwrap();
        assert!(result.success);
        let states = labs_repo::states_for_nodes(&st.db, "lab-lc-3", &[node.id])
            .await
            .unwrap();
        assert_eq!(states[0].actual_state, "stopped");
    }
}
