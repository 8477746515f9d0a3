//! Cluster node descriptors

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Capability tag of a cluster node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Dedicated model-hosting node
    Model,
    /// Data node, may host models unless restricted
    Data,
    /// Cluster manager
    ClusterManager,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Model => write!(f, "model"),
            NodeRole::Data => write!(f, "data"),
            NodeRole::ClusterManager => write!(f, "cluster_manager"),
        }
    }
}

/// A member of the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Stable node id
    pub id: String,
    /// Capability tags
    pub roles: BTreeSet<NodeRole>,
}

impl NodeInfo {
    pub fn new(id: impl Into<String>, roles: impl IntoIterator<Item = NodeRole>) -> Self {
        Self {
            id: id.into(),
            roles: roles.into_iter().collect(),
        }
    }

    /// Whether this node is tagged for model hosting
    pub fn is_model_node(&self) -> bool {
        self.roles.contains(&NodeRole::Model)
    }

    /// Whether this node may host a model copy.
    ///
    /// With `only_model_nodes`, data nodes are excluded.
    pub fn can_host_models(&self, only_model_nodes: bool) -> bool {
        self.is_model_node() || (!only_model_nodes && self.roles.contains(&NodeRole::Data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_node() {
        let node = NodeInfo::new("n1", [NodeRole::Model]);
        assert!(node.is_model_node());
        assert!(node.can_host_models(true));
    }

    #[test]
    fn test_data_node_hosting() {
        let node = NodeInfo::new("n2", [NodeRole::Data]);
        assert!(!node.is_model_node());
        assert!(node.can_host_models(false));
        assert!(!node.can_host_models(true));
    }

    #[test]
    fn test_manager_only_node() {
        let node = NodeInfo::new("n3", [NodeRole::ClusterManager]);
        assert!(!node.can_host_models(false));
        assert_eq!(NodeRole::ClusterManager.to_string(), "cluster_manager");
    }
}
