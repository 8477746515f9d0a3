//! modelplane-network: Cluster-facing plumbing
//!
//! This crate provides:
//! - The cluster membership feed (node list, capability tags, join/leave events)
//! - Node balancing for routing predictions to hosting nodes
//! - Peer dispatch of node-local deploy/undeploy requests

pub mod balancer;
pub mod dispatch;
pub mod membership;

pub use balancer::{BalanceStrategy, NodeBalancer};
pub use dispatch::{HttpNodeDispatcher, NodeDeployRequest, NodeDispatcher, NodeUndeployRequest};
pub use membership::{ClusterMembership, MembershipEvent, StaticMembership};
