//! HTTP client for agent RPC.
//!
//! Every call carries the shared bearer secret and an explicit timeout.
//! Connection-level failures map to `Unavailable` so the lifecycle manager
//! keeps nodes in their transient state instead of erroring them.

use std::time::Duration;

use archetype_types::{
    ActionResponse, CapacityRequest, CapacityResponse, DeployRequest, DeployResponse,
    ImageCheckResponse, TopologyLinkSpec, TopologyNodeSpec, TunnelCreateRequest,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentCallError {
    #[error("agent unavailable: {0}")]
    Unavailable(String),
    #[error("agent rejected request: {0}")]
    Rejected(String),
}

pub struct AgentClient {
    base: String,
    http: reqwest::Client,
    secret: String,
}

impl AgentClient {
    pub fn new(address: &str, secret: &str, timeout_secs: u64) -> Self {
        Self {
            base: address.trim_end_matches('/').to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .expect("reqwest client"),
            secret: secret.to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base, path));
        if self.secret.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.secret)
        }
    }

    async fn post_json<B: serde::Serialize, R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, AgentCallError> {
        let response = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await
            .map_err(|err| AgentCallError::Unavailable(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentCallError::Rejected(format!("{status}: {body}")));
        }
        response
            .json()
            .await
            .map_err(|err| AgentCallError::Rejected(err.to_string()))
    }

    async fn get_json<R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<R, AgentCallError> {
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(|err| AgentCallError::Unavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(AgentCallError::Rejected(response.status().to_string()));
        }
        response
            .json()
            .await
            .map_err(|err| AgentCallError::Rejected(err.to_string()))
    }

    pub async fn deploy(&self, request: &DeployRequest) -> Result<DeployResponse, AgentCallError> {
        self.post_json("/deploy", request).await
    }

    pub async fn start_node(
        &self,
        lab_id: &str,
        node_name: &str,
        node: &TopologyNodeSpec,
        links: &[TopologyLinkSpec],
    ) -> Result<ActionResponse, AgentCallError> {
        self.post_json(
            &format!("/nodes/{lab_id}/{node_name}/start"),
            &serde_json::json!({ "node": node, "links": links }),
        )
        .await
    }

    pub async fn stop_node(
        &self,
        lab_id: &str,
        node_name: &str,
    ) -> Result<ActionResponse, AgentCallError> {
        self.post_json(
            &format!("/nodes/{lab_id}/{node_name}/stop"),
            &serde_json::json!({}),
        )
        .await
    }

    pub async fn destroy_lab(&self, lab_id: &str) -> Result<ActionResponse, AgentCallError> {
        self.post_json(&format!("/labs/{lab_id}/destroy"), &serde_json::json!({}))
            .await
    }

    pub async fn capacity(
        &self,
        request: &CapacityRequest,
    ) -> Result<CapacityResponse, AgentCallError> {
        self.post_json("/capacity", request).await
    }

    pub async fn check_images(
        &self,
        images: &[String],
    ) -> Result<ImageCheckResponse, AgentCallError> {
        self.get_json(&format!("/images/check?images={}", images.join(",")))
            .await
    }

    /// VLAN tag currently on a node interface's OVS port.
    pub async fn endpoint_vlan(
        &self,
        lab_id: &str,
        node_name: &str,
        interface: &str,
    ) -> Result<u16, AgentCallError> {
        let value: serde_json::Value = self
            .get_json(&format!("/labs/{lab_id}/endpoints/{node_name}/{interface}/vlan"))
            .await?;
        value
            .get("vlan")
            .and_then(|v| v.as_u64())
            .map(|v| v as u16)
            .ok_or_else(|| {
                AgentCallError::Rejected(format!("no vlan for {node_name}:{interface}: {value}"))
            })
    }

    pub async fn create_tunnel(
        &self,
        request: &TunnelCreateRequest,
    ) -> Result<serde_json::Value, AgentCallError> {
        self.post_json("/overlay/tunnels", request).await
    }

    /// Stop containers on the agent whose labs the controller no longer
    /// tracks.
    pub async fn cleanup_orphans(
        &self,
        valid_lab_ids: &[String],
    ) -> Result<serde_json::Value, AgentCallError> {
        self.post_json(
            "/labs/cleanup-orphans",
            &serde_json::json!({ "valid_lab_ids": valid_lab_ids }),
        )
        .await
    }
}
