//! Write leases: exclusion, expiry, release and the `Required` policy.

use std::time::Duration;

use anyhow::Result;

use raft_file_store::cluster::{ClusterOptions, LocalCluster};
use raft_file_store::config::LeasePolicy;
use raft_file_store::error::{Error, FileError};

const LIMIT: Duration = Duration::from_secs(10);

fn is_not_holder(err: &Error) -> bool {
    matches!(err, Error::File(FileError::NotLeaseHolder { .. }))
}

#[tokio::test]
async fn test_lease_excludes_other_writers() -> Result<()> {
    let cluster = LocalCluster::start(3, ClusterOptions::default())?;
    cluster.wait_for_leader(LIMIT).await?;
    let alice = cluster.gateway("alice");
    let bob = cluster.gateway("bob");

    alice.create("/shared", "v1").await?;
    let lease = alice.acquire_lease("/shared", Duration::from_secs(30)).await?;
    assert_eq!(lease.holder, "alice");

    let err = bob.write("/shared", "v2", 1).await.unwrap_err();
    assert!(is_not_holder(&err), "{err}");
    let err = bob.acquire_lease("/shared", Duration::from_secs(30)).await.unwrap_err();
    assert!(is_not_holder(&err), "{err}");
    let err = bob.release_lease("/shared").await.unwrap_err();
    assert!(is_not_holder(&err), "{err}");

    assert_eq!(alice.write("/shared", "v2", 1).await?, 2);

    alice.release_lease("/shared").await?;
    assert_eq!(bob.write("/shared", "v3", 2).await?, 3);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_renewal_keeps_grant_and_extends() -> Result<()> {
    let cluster = LocalCluster::start(3, ClusterOptions::default())?;
    cluster.wait_for_leader(LIMIT).await?;
    let alice = cluster.gateway("alice");

    let first = alice.acquire_lease("/f", Duration::from_secs(10)).await?;
    let renewed = alice.acquire_lease("/f", Duration::from_secs(60)).await?;
    assert_eq!(renewed.granted_at_index, first.granted_at_index);
    assert!(renewed.expires_at > first.expires_at);

    // A shorter renewal never cuts the lease short.
    let short = alice.acquire_lease("/f", Duration::from_millis(1)).await?;
    assert_eq!(short.expires_at, renewed.expires_at);

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_lease_expires() -> Result<()> {
    let cluster = LocalCluster::start(3, ClusterOptions::default())?;
    let leader = cluster.wait_for_leader(LIMIT).await?;
    let alice = cluster.gateway("alice");
    let bob = cluster.gateway("bob");

    alice.create("/f", "v1").await?;
    alice.acquire_lease("/f", Duration::from_millis(200)).await?;
    assert!(is_not_holder(&bob.write("/f", "blocked", 1).await.unwrap_err()));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(bob.write("/f", "after expiry", 1).await?, 2);
    let node = cluster.node(leader).expect("leader is running");
    assert!(node.lease("/f").await?.is_none());

    cluster.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_required_policy_needs_a_lease() -> Result<()> {
    let options = ClusterOptions {
        lease_policy: LeasePolicy::Required,
        ..ClusterOptions::default()
    };
    let cluster = LocalCluster::start(3, options)?;
    cluster.wait_for_leader(LIMIT).await?;
    let alice = cluster.gateway("alice");

    let err = alice.create("/locked", "x").await.unwrap_err();
    assert!(matches!(err, Error::File(FileError::LeaseRequired { .. })), "{err}");

    alice.acquire_lease("/locked", Duration::from_secs(30)).await?;
    assert_eq!(alice.create("/locked", "x").await?, 1);
    assert_eq!(alice.write("/locked", "y", 1).await?, 2);

    alice.release_lease("/locked").await?;
    let err = alice.delete("/locked").await.unwrap_err();
    assert!(matches!(err, Error::File(FileError::LeaseRequired { .. })), "{err}");

    cluster.shutdown().await;
    Ok(())
}
