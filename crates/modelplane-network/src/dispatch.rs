//! Forwarding node-local lifecycle requests to peers

use async_trait::async_trait;
use modelplane_core::{ModelPlaneError, ModelPlaneResult, PeerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(600);

/// Deploy a model on the receiving node only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDeployRequest {
    pub model_id: String,
    /// Every node the cluster-wide deploy targets
    #[serde(default)]
    pub target_nodes: Vec<String>,
    #[serde(default)]
    pub deploy_to_all_nodes: bool,
}

/// Undeploy models from the receiving node only
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUndeployRequest {
    /// Empty means every model on the node
    #[serde(default)]
    pub model_ids: Vec<String>,
}

/// Sends node-local requests to other cluster members
#[async_trait]
pub trait NodeDispatcher: Send + Sync {
    async fn deploy(&self, node_id: &str, request: &NodeDeployRequest) -> ModelPlaneResult<()>;

    async fn undeploy(&self, node_id: &str, request: &NodeUndeployRequest) -> ModelPlaneResult<()>;
}

/// Dispatches over each peer's REST API
pub struct HttpNodeDispatcher {
    client: reqwest::Client,
    /// Base URL by node id
    peers: HashMap<String, String>,
}

impl HttpNodeDispatcher {
    pub fn new(peers: &[PeerConfig]) -> Self {
        Self {
            client: reqwest::Client::new(),
            peers: peers
                .iter()
                .map(|p| (p.id.clone(), p.address.trim_end_matches('/').to_string()))
                .collect(),
        }
    }

    fn base_url(&self, node_id: &str) -> ModelPlaneResult<&str> {
        self.peers
            .get(node_id)
            .map(String::as_str)
            .ok_or_else(|| ModelPlaneError::not_found(format!("address of node {}", node_id)))
    }

    async fn post<T: Serialize + Sync>(&self, node_id: &str, url: String, body: &T) -> ModelPlaneResult<()> {
        debug!(node_id = node_id, url = %url, "Dispatching to peer");
        let response = self
            .client
            .post(&url)
            .timeout(DISPATCH_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(|e| ModelPlaneError::TransientInfra(format!("node {}: {}", node_id, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        warn!(node_id = node_id, status = %status, "Peer rejected request");
        Err(ModelPlaneError::runtime(format!(
            "node {} returned {}: {}",
            node_id, status, body
        )))
    }
}

#[async_trait]
impl NodeDispatcher for HttpNodeDispatcher {
    async fn deploy(&self, node_id: &str, request: &NodeDeployRequest) -> ModelPlaneResult<()> {
        let url = format!(
            "{}/local/models/{}/_deploy",
            self.base_url(node_id)?,
            request.model_id
        );
        self.post(node_id, url, request).await
    }

    async fn undeploy(&self, node_id: &str, request: &NodeUndeployRequest) -> ModelPlaneResult<()> {
        let url = format!("{}/local/models/_undeploy", self.base_url(node_id)?);
        self.post(node_id, url, request).await
    }
}
