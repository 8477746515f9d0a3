//! Worker node routing
//!
//! Decides which nodes may host models, keeps the cache's worker-node sets in
//! line with cluster membership and picks a hosting node per prediction.

use modelplane_core::{ModelPlaneError, ModelPlaneResult, NodeInfo};
use modelplane_network::{ClusterMembership, MembershipEvent, NodeBalancer};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::cache::ModelCache;

pub struct WorkerNodeRouter {
    cache: Arc<ModelCache>,
    membership: Arc<dyn ClusterMembership>,
    balancer: NodeBalancer,
    /// Only nodes tagged `model` are eligible
    only_model_nodes: bool,
}

impl WorkerNodeRouter {
    pub fn new(
        cache: Arc<ModelCache>,
        membership: Arc<dyn ClusterMembership>,
        balancer: NodeBalancer,
        only_model_nodes: bool,
    ) -> Self {
        Self {
            cache,
            membership,
            balancer,
            only_model_nodes,
        }
    }

    pub fn local_node(&self) -> &NodeInfo {
        self.membership.local_node()
    }

    pub fn membership(&self) -> &Arc<dyn ClusterMembership> {
        &self.membership
    }

    /// Every member allowed to host models
    pub async fn all_eligible_nodes(&self) -> Vec<String> {
        self.membership
            .nodes()
            .await
            .into_iter()
            .filter(|n| n.can_host_models(self.only_model_nodes))
            .map(|n| n.id)
            .collect()
    }

    pub async fn eligible_node_count(&self) -> usize {
        self.all_eligible_nodes().await.len()
    }

    /// Resolve deploy targets.
    ///
    /// An empty request means every eligible node; otherwise requested nodes
    /// that are unknown or not eligible are dropped. Fails with
    /// `NoEligibleNodes` rather than returning an empty set.
    pub async fn eligible_nodes(&self, requested: &[String]) -> ModelPlaneResult<Vec<String>> {
        let eligible = self.all_eligible_nodes().await;
        let selected: Vec<String> = if requested.is_empty() {
            eligible
        } else {
            let eligible: BTreeSet<String> = eligible.into_iter().collect();
            let requested: BTreeSet<&String> = requested.iter().collect();
            for node in requested.iter().filter(|n| !eligible.contains(**n)) {
                warn!(node_id = %node, "Requested node cannot host models");
            }
            requested
                .into_iter()
                .filter(|n| eligible.contains(*n))
                .cloned()
                .collect()
        };

        if selected.is_empty() {
            return Err(ModelPlaneError::NoEligibleNodes(
                "no eligible node found to deploy the model".to_string(),
            ));
        }
        Ok(selected)
    }

    /// Strip a departed node from every model and re-split rate limits
    pub async fn on_node_left(&self, node_id: &str) -> Vec<String> {
        let departed = BTreeSet::from([node_id.to_string()]);
        let evicted = self.cache.remove_worker_nodes(&departed, false);
        self.resize_rate_limiters().await;
        evicted
    }

    pub async fn on_node_joined(&self, node: &NodeInfo) {
        debug!(node_id = %node.id, "Node joined, re-sizing rate limiters");
        self.resize_rate_limiters().await;
    }

    pub async fn resize_rate_limiters(&self) {
        let count = self.eligible_node_count().await;
        if count == 0 {
            warn!("No eligible nodes, keeping current rate limiters");
            return;
        }
        self.cache.resize_rate_limiters(count);
    }

    /// Replace worker sets with a cluster-collected snapshot
    pub fn sync(&self, snapshot: &HashMap<String, BTreeSet<String>>) {
        self.cache.sync_worker_nodes(snapshot);
    }

    pub fn routing_table(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.cache.routing_table()
    }

    /// Pick a node hosting `model_id`
    pub fn select_node(&self, model_id: &str) -> ModelPlaneResult<String> {
        let nodes = self.cache.worker_nodes(model_id);
        self.balancer
            .select(&nodes)
            .cloned()
            .ok_or_else(|| ModelPlaneError::not_found(format!("no worker node hosts model {}", model_id)))
    }

    /// Apply membership events until the feed closes
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<MembershipEvent>) {
        info!("Worker node router started");
        loop {
            match events.recv().await {
                Ok(MembershipEvent::NodeLeft(node_id)) => {
                    let evicted = self.on_node_left(&node_id).await;
                    info!(node_id = %node_id, evicted = evicted.len(), "Handled node departure");
                }
                Ok(MembershipEvent::NodeJoined(node)) => self.on_node_joined(&node).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed = missed, "Missed membership events, re-sizing rate limiters");
                    self.resize_rate_limiters().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("Worker node router stopped");
    }
}
