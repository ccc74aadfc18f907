//! Leader election across an in-process cluster and over TCP.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use raft_file_store::blob::MemoryBlobStore;
use raft_file_store::cluster::{ClusterOptions, LocalCluster};
use raft_file_store::config::NodeConfig;
use raft_file_store::node::Role;
use raft_file_store::runtime::{spawn_node, NodeHandle};
use raft_file_store::storage::MemoryLogStore;
use raft_file_store::transport::TcpTransport;

const LIMIT: Duration = Duration::from_secs(10);

fn leaders(cluster: &LocalCluster) -> Vec<(u64, u64)> {
    cluster
        .statuses()
        .into_iter()
        .filter(|s| s.role == Role::Leader)
        .map(|s| (s.term, s.id))
        .collect()
}

#[tokio::test]
async fn test_three_nodes_elect_one_leader() -> Result<()> {
    let cluster = LocalCluster::start(3, ClusterOptions::default())?;
    let leader = cluster.wait_for_leader(LIMIT).await?;

    let statuses = cluster.statuses();
    let term = statuses.iter().find(|s| s.id == leader).map(|s| s.term);
    for status in &statuses {
        if status.term == term.unwrap_or_default() {
            assert_eq!(status.leader, Some(leader), "node {} disagrees", status.id);
        }
    }

    // At most one leader per term.
    let mut seen = HashMap::new();
    for (term, id) in leaders(&cluster) {
        if let Some(other) = seen.insert(term, id) {
            panic!("nodes {other} and {id} both lead term {term}");
        }
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_leader_commits_noop_on_election() -> Result<()> {
    let cluster = LocalCluster::start(5, ClusterOptions::default())?;
    let leader = cluster.wait_for_leader(LIMIT).await?;
    let handle = cluster.node(leader).expect("leader is running");

    // The no-op barrier of the new term commits without any client write.
    let deadline = Instant::now() + LIMIT;
    while handle.status().commit_index == 0 {
        if Instant::now() >= deadline {
            bail!("leader never committed its barrier entry");
        }
        time::sleep(Duration::from_millis(10)).await;
    }

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_forced_campaign_moves_leadership() -> Result<()> {
    let cluster = LocalCluster::start(3, ClusterOptions::default())?;
    let first = cluster.wait_for_leader(LIMIT).await?;
    let first_term = cluster.node(first).expect("leader is running").status().term;
    let target = cluster
        .ids()
        .iter()
        .copied()
        .find(|id| *id != first)
        .expect("three members");

    let handle = cluster.node(target).expect("target is running");
    let deadline = Instant::now() + LIMIT;
    loop {
        // The target may lag behind the leader's barrier; campaign again until
        // its log is current and it wins.
        cluster.wait_for_applied(1, LIMIT).await?;
        handle.campaign().await?;
        time::sleep(Duration::from_millis(200)).await;
        if cluster.agreed_leader() == Some(target) {
            break;
        }
        if Instant::now() >= deadline {
            bail!("node {target} never took over from {first}");
        }
    }
    assert!(handle.status().term > first_term);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_stopping_the_leader_triggers_reelection() -> Result<()> {
    let mut cluster = LocalCluster::start(3, ClusterOptions::default())?;
    let old = cluster.wait_for_leader(LIMIT).await?;
    let old_term = cluster.node(old).expect("leader is running").status().term;

    cluster.stop(old).await;
    let new = cluster.wait_for_leader(LIMIT).await?;
    assert_ne!(new, old);
    let new_term = cluster.node(new).expect("new leader is running").status().term;
    assert!(new_term > old_term);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_single_node_elects_itself() -> Result<()> {
    let cluster = LocalCluster::start(1, ClusterOptions::default())?;
    assert_eq!(cluster.wait_for_leader(LIMIT).await?, 1);
    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_tcp_cluster_elects_leader() -> Result<()> {
    let ids = [1u64, 2, 3];
    let mut inboxes = Vec::new();
    let mut addresses = HashMap::new();
    let mut listeners = Vec::new();
    for id in ids {
        let (tx, rx) = mpsc::unbounded_channel();
        let (listener, addr) = TcpTransport::listen("127.0.0.1:0", tx).await?;
        addresses.insert(id, addr.to_string());
        inboxes.push((id, rx));
        listeners.push(listener);
    }

    let transport = Arc::new(TcpTransport::new(addresses));
    let mut handles: Vec<NodeHandle> = Vec::new();
    for (id, inbox) in inboxes {
        let peers = ids.iter().copied().filter(|p| *p != id).collect();
        let mut config = NodeConfig::new(id, peers);
        config.tick_interval = Duration::from_millis(20);
        let (handle, _tasks) = spawn_node(
            config,
            MemoryLogStore::new(),
            Arc::new(MemoryBlobStore::new()),
            transport.clone(),
            inbox,
        )?;
        handles.push(handle);
    }

    let deadline = Instant::now() + LIMIT;
    let leader = loop {
        let statuses: Vec<_> = handles.iter().map(NodeHandle::status).collect();
        let leader = statuses.iter().find(|s| s.role == Role::Leader).map(|s| s.id);
        if let Some(leader) = leader {
            if statuses.iter().filter(|s| s.leader == Some(leader)).count() >= 2 {
                break leader;
            }
        }
        if Instant::now() >= deadline {
            bail!("no leader over tcp: {statuses:?}");
        }
        time::sleep(Duration::from_millis(20)).await;
    };
    assert!(ids.contains(&leader));

    for handle in &handles {
        handle.shutdown().await;
    }
    for listener in listeners {
        listener.abort();
    }
    Ok(())
}
