//! Cluster membership feed

use async_trait::async_trait;
use modelplane_core::{NodeConfig, NodeInfo};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 64;

/// A change in cluster membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    NodeJoined(NodeInfo),
    NodeLeft(String),
}

/// Source of the current node list and join/leave events
#[async_trait]
pub trait ClusterMembership: Send + Sync {
    /// The node this process runs on
    fn local_node(&self) -> &NodeInfo;

    /// Every current member, local node included
    async fn nodes(&self) -> Vec<NodeInfo>;

    /// A member by id
    async fn node(&self, node_id: &str) -> Option<NodeInfo>;

    /// Receive future membership events
    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}

/// Membership driven by configuration and explicit join/leave calls
pub struct StaticMembership {
    local: NodeInfo,
    /// Members indexed by node id
    nodes: RwLock<HashMap<String, NodeInfo>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl StaticMembership {
    pub fn new(local: NodeInfo) -> Self {
        Self::with_peers(local, Vec::new())
    }

    /// Local node plus known peers
    pub fn with_peers(local: NodeInfo, peers: Vec<NodeInfo>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let nodes = peers
            .into_iter()
            .chain(std::iter::once(local.clone()))
            .map(|node| (node.id.clone(), node))
            .collect();
        Self {
            local,
            nodes: RwLock::new(nodes),
            events,
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        let local = NodeInfo::new(config.id.clone(), config.roles.iter().copied());
        let peers = config
            .peers
            .iter()
            .map(|peer| NodeInfo::new(peer.id.clone(), peer.roles.iter().copied()))
            .collect();
        Self::with_peers(local, peers)
    }

    /// Add or replace a member and announce it
    pub async fn join(&self, node: NodeInfo) {
        self.nodes.write().await.insert(node.id.clone(), node.clone());
        info!(node_id = %node.id, "Node joined");
        // No receivers is fine
        let _ = self.events.send(MembershipEvent::NodeJoined(node));
    }

    /// Remove a member; returns whether it was present
    pub async fn leave(&self, node_id: &str) -> bool {
        let removed = self.nodes.write().await.remove(node_id).is_some();
        if removed {
            info!(node_id = node_id, "Node left");
            let _ = self.events.send(MembershipEvent::NodeLeft(node_id.to_string()));
        } else {
            debug!(node_id = node_id, "Ignoring leave of unknown node");
        }
        removed
    }
}

#[async_trait]
impl ClusterMembership for StaticMembership {
    fn local_node(&self) -> &NodeInfo {
        &self.local
    }

    async fn nodes(&self) -> Vec<NodeInfo> {
        let nodes = self.nodes.read().await;
        let mut list: Vec<NodeInfo> = nodes.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    async fn node(&self, node_id: &str) -> Option<NodeInfo> {
        self.nodes.read().await.get(node_id).cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }
}
