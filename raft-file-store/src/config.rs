//! Node and consensus configuration.

use std::ops::Range;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::NodeId;

/// Logical clock interval, in ticks.
pub type Ticks = u32;

/// Consensus timing, measured in ticks of the node's logical clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftConfig {
    /// Ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// Election timeouts are drawn uniformly from this range.
    pub election_timeout: Range<Ticks>,
    /// Largest number of entries carried by one AppendEntries.
    pub max_append_entries: usize,
    /// Seeds the election timeout generator, for reproducible tests.
    pub rng_seed: Option<u64>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: 2,
            election_timeout: 10..20,
            max_append_entries: 64,
            rng_seed: None,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "election timeout range {:?} is empty",
                self.election_timeout
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout.start {
            return Err(Error::InvalidConfig(format!(
                "heartbeat interval {} must be positive and below the election timeout floor {}",
                self.heartbeat_interval, self.election_timeout.start
            )));
        }
        if self.max_append_entries == 0 {
            return Err(Error::InvalidConfig("max_append_entries must be positive".into()));
        }
        Ok(())
    }
}

/// How reads are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReadConsistency {
    /// Only a leader that can prove it is still the leader serves reads,
    /// after its state machine caught up with its commit index.
    #[default]
    Linearizable,
    /// Any node serves reads from whatever it has applied. May be stale.
    Local,
}

/// Whether modifying a file requires holding its lease.
///
/// Must be identical on every node, since it changes apply results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LeasePolicy {
    /// Writers are only rejected when someone else holds an active lease.
    #[default]
    Optional,
    /// Writers must hold an active lease on the path.
    Required,
}

/// Configuration of one node of the cluster.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: NodeId,
    /// Other voters; must not include `id`.
    pub peers: Vec<NodeId>,
    /// Real time per logical tick.
    pub tick_interval: Duration,
    /// How long a proposal may wait for commit before `QuorumTimeout`.
    pub proposal_timeout: Duration,
    pub read_consistency: ReadConsistency,
    pub lease_policy: LeasePolicy,
    pub raft: RaftConfig,
}

impl NodeConfig {
    pub fn new(id: NodeId, peers: Vec<NodeId>) -> Self {
        Self {
            id,
            peers,
            tick_interval: Duration::from_millis(50),
            proposal_timeout: Duration::from_secs(2),
            read_consistency: ReadConsistency::default(),
            lease_policy: LeasePolicy::default(),
            raft: RaftConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.peers.contains(&self.id) {
            return Err(Error::InvalidConfig(format!(
                "node {} lists itself as a peer",
                self.id
            )));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::InvalidConfig("tick interval must be positive".into()));
        }
        self.raft.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(RaftConfig::default().validate().is_ok());
        assert!(NodeConfig::new(1, vec![2, 3]).validate().is_ok());
    }

    #[test]
    fn heartbeat_must_undercut_election_timeout() {
        let config = RaftConfig {
            heartbeat_interval: 10,
            election_timeout: 10..20,
            ..RaftConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn node_cannot_be_its_own_peer() {
        assert!(NodeConfig::new(1, vec![1, 2]).validate().is_err());
    }
}
