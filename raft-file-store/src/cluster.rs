//! In-process cluster over a [`MemoryNetwork`].
//!
//! Used by the `demo` subcommand and the integration tests. Each node keeps
//! its log store and blob store across `stop`/`restart`, so a restart
//! behaves like a process coming back with its disk intact.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant};
use tracing::info;

use crate::blob::MemoryBlobStore;
use crate::client::Gateway;
use crate::config::{LeasePolicy, NodeConfig, RaftConfig, ReadConsistency};
use crate::error::{Error, Result};
use crate::message::NodeId;
use crate::node::{NodeStatus, Role};
use crate::runtime::{spawn_node, NodeHandle, NodeTasks};
use crate::storage::MemoryLogStore;
use crate::topology::ReplicaTopology;
use crate::transport::MemoryNetwork;

#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub tick_interval: Duration,
    pub proposal_timeout: Duration,
    pub read_consistency: ReadConsistency,
    pub lease_policy: LeasePolicy,
    pub raft: RaftConfig,
    /// Node `id` seeds its election timer with `seed + id`.
    pub seed: Option<u64>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
            proposal_timeout: Duration::from_secs(2),
            read_consistency: ReadConsistency::default(),
            lease_policy: LeasePolicy::default(),
            raft: RaftConfig::default(),
            seed: None,
        }
    }
}

struct Member {
    log_store: MemoryLogStore,
    blobs: MemoryBlobStore,
    running: Option<(NodeHandle, NodeTasks)>,
}

pub struct LocalCluster {
    topology: ReplicaTopology,
    options: ClusterOptions,
    network: MemoryNetwork,
    members: BTreeMap<NodeId, Member>,
}

impl LocalCluster {
    /// Starts nodes `1..=size`.
    pub fn start(size: usize, options: ClusterOptions) -> Result<Self> {
        let topology = ReplicaTopology::sequential(size)?;
        let members = topology
            .ids()
            .iter()
            .map(|id| {
                let member = Member {
                    log_store: MemoryLogStore::new(),
                    blobs: MemoryBlobStore::new(),
                    running: None,
                };
                (*id, member)
            })
            .collect();
        let mut cluster = Self {
            topology,
            options,
            network: MemoryNetwork::new(),
            members,
        };
        for id in cluster.topology.ids().to_vec() {
            cluster.spawn(id)?;
        }
        info!(nodes = size, "local cluster started");
        Ok(cluster)
    }

    fn node_config(&self, id: NodeId) -> NodeConfig {
        let mut config = NodeConfig::new(id, self.topology.peers_of(id));
        config.tick_interval = self.options.tick_interval;
        config.proposal_timeout = self.options.proposal_timeout;
        config.read_consistency = self.options.read_consistency;
        config.lease_policy = self.options.lease_policy;
        config.raft = RaftConfig {
            rng_seed: self.options.seed.map(|s| s + id),
            ..self.options.raft.clone()
        };
        config
    }

    fn spawn(&mut self, id: NodeId) -> Result<()> {
        let config = self.node_config(id);
        let inbox = self.network.register(id);
        let member = self
            .members
            .get_mut(&id)
            .ok_or_else(|| Error::InvalidConfig(format!("node {id} is not a member")))?;
        let running = spawn_node(
            config,
            member.log_store.clone(),
            Arc::new(member.blobs.clone()),
            Arc::new(self.network.clone()),
            inbox,
        )?;
        member.running = Some(running);
        Ok(())
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn ids(&self) -> &[NodeId] {
        self.topology.ids()
    }

    /// Handle of a running node.
    pub fn node(&self, id: NodeId) -> Option<&NodeHandle> {
        self.members.get(&id)?.running.as_ref().map(|(handle, _)| handle)
    }

    pub fn running(&self) -> Vec<NodeHandle> {
        self.members
            .values()
            .filter_map(|m| m.running.as_ref().map(|(handle, _)| handle.clone()))
            .collect()
    }

    pub fn statuses(&self) -> Vec<NodeStatus> {
        self.running().iter().map(NodeHandle::status).collect()
    }

    /// A gateway over every member that is running now.
    pub fn gateway(&self, client_id: &str) -> Gateway {
        Gateway::new(client_id, self.running())
    }

    /// Stops a node and waits for its tasks to end. Its stores survive.
    pub async fn stop(&mut self, id: NodeId) {
        self.network.unregister(id);
        let Some(member) = self.members.get_mut(&id) else {
            return;
        };
        if let Some((handle, tasks)) = member.running.take() {
            handle.shutdown().await;
            tasks.applier.abort();
            let _ = tasks.worker.await;
            let _ = tasks.applier.await;
            info!(node = id, "node stopped");
        }
    }

    /// Starts a stopped node on its surviving stores.
    pub fn restart(&mut self, id: NodeId) -> Result<()> {
        if self.node(id).is_some() {
            return Ok(());
        }
        self.spawn(id)?;
        info!(node = id, "node restarted");
        Ok(())
    }

    /// The leader a majority of the cluster currently follows, if any.
    pub fn agreed_leader(&self) -> Option<NodeId> {
        let statuses = self.statuses();
        let mut votes: BTreeMap<(u64, NodeId), usize> = BTreeMap::new();
        for status in &statuses {
            if let Some(leader) = status.leader {
                *votes.entry((status.term, leader)).or_default() += 1;
            }
        }
        votes
            .into_iter()
            .filter(|((_, leader), count)| {
                *count >= self.topology.quorum_size()
                    && statuses.iter().any(|s| s.id == *leader && s.role == Role::Leader)
            })
            .max_by_key(|((term, _), _)| *term)
            .map(|((_, leader), _)| leader)
    }

    /// Waits until a majority follows one leader.
    pub async fn wait_for_leader(&self, limit: Duration) -> Result<NodeId> {
        let deadline = Instant::now() + limit;
        loop {
            if let Some(leader) = self.agreed_leader() {
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                return Err(Error::QuorumTimeout);
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Waits until every running node has applied at least `index`.
    pub async fn wait_for_applied(&self, index: u64, limit: Duration) -> Result<()> {
        for handle in self.running() {
            handle.wait_for_applied(index, limit).await?;
        }
        Ok(())
    }

    pub async fn shutdown(mut self) {
        for id in self.topology.ids().to_vec() {
            self.stop(id).await;
        }
    }
}
