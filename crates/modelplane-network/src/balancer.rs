//! Hosting-node selection strategies

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategy {
    #[default]
    RoundRobin,
    Random,
}

/// Picks one of a model's hosting nodes for each prediction
pub struct NodeBalancer {
    /// Selection strategy
    strategy: BalanceStrategy,
    /// Counter for round-robin
    counter: AtomicUsize,
}

impl NodeBalancer {
    pub fn new(strategy: BalanceStrategy) -> Self {
        Self {
            strategy,
            counter: AtomicUsize::new(0),
        }
    }

    /// Select a node id from the list
    pub fn select<'a>(&self, nodes: &'a [String]) -> Option<&'a String> {
        if nodes.is_empty() {
            return None;
        }

        let index = match self.strategy {
            BalanceStrategy::RoundRobin => self.counter.fetch_add(1, Ordering::Relaxed) % nodes.len(),
            BalanceStrategy::Random => rand::thread_rng().gen_range(0..nodes.len()),
        };

        debug!(
            strategy = ?self.strategy,
            selected_index = index,
            total_nodes = nodes.len(),
            "Selected node"
        );

        nodes.get(index)
    }

    pub fn strategy(&self) -> BalanceStrategy {
        self.strategy
    }
}

impl Default for NodeBalancer {
    fn default() -> Self {
        Self::new(BalanceStrategy::RoundRobin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<String> {
        vec!["n0".to_string(), "n1".to_string(), "n2".to_string()]
    }

    #[test]
    fn test_round_robin() {
        let balancer = NodeBalancer::default();
        let nodes = nodes();

        let picks: Vec<_> = (0..4).map(|_| balancer.select(&nodes).unwrap().as_str()).collect();
        assert_eq!(picks, vec!["n0", "n1", "n2", "n0"]);
    }

    #[test]
    fn test_random_stays_in_range() {
        let balancer = NodeBalancer::new(BalanceStrategy::Random);
        let nodes = nodes();
        for _ in 0..50 {
            assert!(nodes.contains(balancer.select(&nodes).unwrap()));
        }
    }

    #[test]
    fn test_empty_nodes() {
        assert!(NodeBalancer::default().select(&[]).is_none());
    }
}
