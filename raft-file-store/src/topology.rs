use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::message::NodeId;

/// The fixed voter set of a cluster.
#[derive(Debug, Clone)]
pub struct ReplicaTopology {
    nodes: Vec<NodeId>,
}

impl ReplicaTopology {
    pub fn new(nodes: Vec<NodeId>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(Error::InvalidConfig("topology requires at least one node".into()));
        }
        let unique: BTreeSet<NodeId> = nodes.iter().copied().collect();
        if unique.len() != nodes.len() {
            return Err(Error::InvalidConfig(format!("duplicate node ids in {nodes:?}")));
        }
        Ok(Self {
            nodes: unique.into_iter().collect(),
        })
    }

    /// Nodes `1..=n`.
    pub fn sequential(n: usize) -> Result<Self> {
        Self::new((1..=n as NodeId).collect())
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Every voter except `id`.
    pub fn peers_of(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes.iter().copied().filter(|n| *n != id).collect()
    }

    pub fn quorum_size(&self) -> usize {
        self.nodes.len() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_duplicate_sets() {
        assert!(ReplicaTopology::new(vec![]).is_err());
        assert!(ReplicaTopology::new(vec![1, 2, 2]).is_err());
    }

    #[test]
    fn quorum_is_a_strict_majority() {
        assert_eq!(ReplicaTopology::sequential(1).unwrap().quorum_size(), 1);
        assert_eq!(ReplicaTopology::sequential(3).unwrap().quorum_size(), 2);
        assert_eq!(ReplicaTopology::sequential(4).unwrap().quorum_size(), 3);
        assert_eq!(ReplicaTopology::sequential(5).unwrap().quorum_size(), 3);
    }

    #[test]
    fn peers_exclude_self() {
        let topology = ReplicaTopology::new(vec![3, 1, 2]).unwrap();
        assert_eq!(topology.ids(), &[1, 2, 3]);
        assert_eq!(topology.peers_of(2), vec![1, 3]);
    }
}
