use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use raft_file_store::blob::DirBlobStore;
use raft_file_store::cli::{Cli, ClusterArgs, Command, DemoArgs, NodeArgs};
use raft_file_store::cluster::{ClusterOptions, LocalCluster};
use raft_file_store::command::Operation;
use raft_file_store::config::NodeConfig;
use raft_file_store::protocol::{ConsoleCommand, HELP};
use raft_file_store::runtime::{spawn_node, NodeHandle};
use raft_file_store::storage::FileLogStore;
use raft_file_store::transport::TcpTransport;
use raft_file_store::Error;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Demo(args) => run_demo(args).await,
        Command::Node(args) => run_node(args).await,
    }
}

fn cluster_options(args: &ClusterArgs) -> ClusterOptions {
    ClusterOptions {
        tick_interval: Duration::from_millis(args.tick_ms.max(1)),
        read_consistency: args.reads.into(),
        lease_policy: args.lease_policy(),
        ..ClusterOptions::default()
    }
}

async fn run_demo(args: DemoArgs) -> Result<()> {
    if args.nodes == 0 {
        bail!("a cluster needs at least one node");
    }
    let mut cluster = LocalCluster::start(args.nodes, cluster_options(&args.cluster))?;
    cluster.network().set_drop_rate(args.drop_rate);
    if args.latency_ms > 0 {
        cluster
            .network()
            .set_latency(Some(Duration::ZERO..Duration::from_millis(args.latency_ms)));
    }
    let election_limit = Duration::from_secs(10);

    let leader = cluster.wait_for_leader(election_limit).await?;
    println!("leader elected: node {leader}");

    let alice = cluster.gateway("client-1");
    let bob = cluster.gateway("client-2");
    let path = "/example.txt";

    let version = alice.create(path, "Hello, world!").await?;
    println!("client-1 created {path} at version {version}");
    report_read("client-2", bob.read(path).await);

    let version = alice.write(path, "Updated content", version).await?;
    println!("client-1 wrote version {version}");
    report_read("client-2", bob.read(path).await);

    match bob.write(path, "stale update", 1).await {
        Err(err) => println!("client-2 write against version 1 rejected: {err}"),
        Ok(v) => println!("client-2 write unexpectedly succeeded at version {v}"),
    }

    let lease = alice.acquire_lease(path, Duration::from_secs(2)).await?;
    println!("client-1 holds the lease until {}", lease.expires_at);
    match bob.write(path, "blocked by lease", version).await {
        Err(err) => println!("client-2 write during lease rejected: {err}"),
        Ok(v) => println!("client-2 write unexpectedly succeeded at version {v}"),
    }
    alice.release_lease(path).await?;
    println!("client-1 released the lease");

    let version = alice.delete(path).await?;
    println!("client-1 deleted {path} (version {version})");
    report_read("client-2", bob.read(path).await);

    let leader = cluster.wait_for_leader(election_limit).await?;
    println!("stopping leader node {leader}");
    cluster.stop(leader).await;
    let new_leader = cluster.wait_for_leader(election_limit).await?;
    println!("new leader elected: node {new_leader}");

    let survivor = cluster.gateway("client-1");
    let path = "/after-failover.txt";
    let version = survivor.create(path, "written after failover").await?;
    println!("client-1 created {path} at version {version}");
    report_read("client-1", survivor.read(path).await);

    for status in cluster.statuses() {
        println!(
            "node {}: {:?} term {} leader {:?} commit {} applied {}",
            status.id,
            status.role,
            status.term,
            status.leader,
            status.commit_index,
            status.last_applied
        );
    }
    let stats = cluster.network().stats();
    println!("network: {} delivered, {} dropped", stats.delivered, stats.dropped);

    cluster.shutdown().await;
    Ok(())
}

fn report_read(client: &str, result: raft_file_store::Result<raft_file_store::store::FileContent>) {
    match result {
        Ok(file) => println!(
            "{client} read {} version {}: {:?}",
            file.path,
            file.version,
            String::from_utf8_lossy(&file.content)
        ),
        Err(err) => println!("{client} read failed: {err}"),
    }
}

async fn run_node(args: NodeArgs) -> Result<()> {
    let peers: Vec<_> = args.peers.iter().map(|(id, _)| *id).collect();
    let addresses: HashMap<_, _> = args.peers.iter().cloned().collect();

    let mut config = NodeConfig::new(args.id, peers);
    config.tick_interval = Duration::from_millis(args.cluster.tick_ms.max(1));
    config.read_consistency = args.cluster.reads.into();
    config.lease_policy = args.cluster.lease_policy();

    let log_store = FileLogStore::open(args.data_dir.join("log"))
        .with_context(|| format!("failed to open log in {}", args.data_dir.display()))?;
    let blobs = DirBlobStore::open(args.data_dir.join("blobs"))?;

    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let (_listener, local) = TcpTransport::listen(&args.listen, inbox_tx)
        .await
        .with_context(|| format!("failed to listen on {}", args.listen))?;
    info!(node = args.id, %local, "listening for peers");

    let transport = Arc::new(TcpTransport::new(addresses));
    let (handle, tasks) = spawn_node(config, log_store, Arc::new(blobs), transport, inbox_rx)?;
    let client_id = args.client_id.unwrap_or_else(|| format!("node-{}", args.id));

    println!("Node {} ready. Type HELP (or h) for commands.", args.id);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match ConsoleCommand::parse(&line) {
            Ok(ConsoleCommand::Exit) => break,
            Ok(command) => {
                if let Err(err) = execute(&handle, &client_id, command).await {
                    println!("error: {err}");
                }
            }
            Err(err) => println!("error: {err}"),
        }
    }

    handle.shutdown().await;
    if let Err(err) = tasks.worker.await {
        warn!(error = %err, "worker ended abnormally");
    }
    Ok(())
}

async fn execute(
    handle: &NodeHandle,
    client_id: &str,
    command: ConsoleCommand,
) -> raft_file_store::Result<()> {
    let writer = client_id.to_string();
    let op = match command {
        ConsoleCommand::Create { path, content } => Operation::CreateFile {
            path,
            content: content.into_bytes(),
            writer,
        },
        ConsoleCommand::Write {
            path,
            expected_version,
            content,
        } => Operation::WriteFile {
            path,
            content: content.into_bytes(),
            expected_version,
            writer,
        },
        ConsoleCommand::Delete { path } => Operation::DeleteFile { path, writer },
        ConsoleCommand::Lease { path, duration } => Operation::AcquireLease {
            path,
            holder: writer,
            duration,
        },
        ConsoleCommand::Release { path } => Operation::ReleaseLease { path, holder: writer },
        ConsoleCommand::Read { path } => {
            let file = handle.read(&path).await?;
            println!(
                "{} v{} by {} at {}: {}",
                file.path,
                file.version,
                file.writer,
                file.timestamp,
                String::from_utf8_lossy(&file.content)
            );
            return Ok(());
        }
        ConsoleCommand::History { path } => {
            for v in handle.history(&path).await? {
                let kind = if v.deleted { "deleted" } else { "written" };
                println!(
                    "v{} {kind} by {} at {} ({} bytes, index {})",
                    v.version, v.writer, v.timestamp, v.size, v.log_index
                );
            }
            return Ok(());
        }
        ConsoleCommand::List => {
            for path in handle.list().await? {
                println!("{path}");
            }
            return Ok(());
        }
        ConsoleCommand::Status => {
            let s = handle.status();
            println!(
                "node {} {:?} term {} leader {:?} commit {} applied {} last index {}",
                s.id, s.role, s.term, s.leader, s.commit_index, s.last_applied, s.last_log_index
            );
            return Ok(());
        }
        ConsoleCommand::Campaign => {
            handle.campaign().await?;
            println!("election started");
            return Ok(());
        }
        ConsoleCommand::Help => {
            println!("{HELP}");
            return Ok(());
        }
        ConsoleCommand::Exit => return Ok(()),
    };

    match handle.propose(op).await {
        Ok(outcome) => match outcome.result {
            Ok(result) => println!("ok at index {}: {result:?}", outcome.index),
            Err(err) => println!("rejected at index {}: {err}", outcome.index),
        },
        Err(Error::NotLeader { leader_hint }) => {
            println!("not the leader; try node {leader_hint:?}");
        }
        Err(err) => return Err(err),
    }
    Ok(())
}
