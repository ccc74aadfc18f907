use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{LeasePolicy, ReadConsistency};
use crate::message::NodeId;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an in-process cluster through a scripted scenario.
    Demo(DemoArgs),
    /// Run one node over TCP with an interactive console.
    Node(NodeArgs),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ReadMode {
    /// Leader-only reads that observe every acknowledged write.
    Linearizable,
    /// Reads from whatever the local node has applied.
    Local,
}

impl From<ReadMode> for ReadConsistency {
    fn from(mode: ReadMode) -> Self {
        match mode {
            ReadMode::Linearizable => ReadConsistency::Linearizable,
            ReadMode::Local => ReadConsistency::Local,
        }
    }
}

/// Options shared by both subcommands.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Real time per logical tick, in milliseconds.
    #[arg(long, default_value_t = 50)]
    pub tick_ms: u64,

    /// Read consistency policy.
    #[arg(long, value_enum, default_value_t = ReadMode::Linearizable)]
    pub reads: ReadMode,

    /// Require writers to hold a lease on the path they modify.
    #[arg(long)]
    pub require_leases: bool,
}

impl ClusterArgs {
    pub fn lease_policy(&self) -> LeasePolicy {
        if self.require_leases {
            LeasePolicy::Required
        } else {
            LeasePolicy::Optional
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    /// Number of nodes in the cluster.
    #[arg(long, default_value_t = 5)]
    pub nodes: usize,

    /// Probability that the simulated network drops a message.
    #[arg(long, default_value_t = 0.0)]
    pub drop_rate: f64,

    /// Upper bound of simulated network latency, in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub latency_ms: u64,

    #[command(flatten)]
    pub cluster: ClusterArgs,
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Numeric id of this node.
    #[arg(long)]
    pub id: NodeId,

    /// Address to accept consensus messages on, e.g. 127.0.0.1:7101.
    #[arg(long)]
    pub listen: String,

    /// Other members as id=addr; repeat or separate with commas.
    #[arg(long = "peer", value_delimiter = ',', value_parser = parse_peer)]
    pub peers: Vec<(NodeId, String)>,

    /// Directory for the log and file contents.
    #[arg(long)]
    pub data_dir: PathBuf,

    /// Identity used as writer and lease holder for console commands.
    #[arg(long)]
    pub client_id: Option<String>,

    #[command(flatten)]
    pub cluster: ClusterArgs,
}

fn parse_peer(value: &str) -> Result<(NodeId, String), String> {
    let (id, addr) = value
        .split_once('=')
        .ok_or_else(|| format!("expected id=addr, got {value:?}"))?;
    let id = id
        .trim()
        .parse()
        .map_err(|_| format!("invalid node id {id:?}"))?;
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(format!("missing address for node {id}"));
    }
    Ok((id, addr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_parse_as_id_and_address() {
        assert_eq!(parse_peer("2=127.0.0.1:7102"), Ok((2, "127.0.0.1:7102".into())));
        assert!(parse_peer("127.0.0.1:7102").is_err());
        assert!(parse_peer("x=127.0.0.1:7102").is_err());
        assert!(parse_peer("2=").is_err());
    }

    #[test]
    fn node_arguments_parse() {
        let cli = Cli::try_parse_from([
            "raft-file-store",
            "node",
            "--id",
            "1",
            "--listen",
            "127.0.0.1:7101",
            "--peer",
            "2=127.0.0.1:7102,3=127.0.0.1:7103",
            "--data-dir",
            "/tmp/node1",
            "--reads",
            "local",
        ])
        .unwrap();
        let Command::Node(args) = cli.command else {
            panic!("expected node subcommand");
        };
        assert_eq!(args.peers.len(), 2);
        assert_eq!(args.cluster.reads, ReadMode::Local);
        assert_eq!(args.cluster.lease_policy(), LeasePolicy::Optional);
    }
}
