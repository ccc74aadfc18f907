//! Replicated file store on a Raft consensus engine.
//!
//! A cluster of nodes agrees on an ordered log of file operations (create,
//! write, delete, acquire and release lease). A single elected leader
//! sequences writes; once an entry is stored on a majority it is committed
//! and every replica applies it to its file table in log order.
//!
//! # Architecture
//!
//! Each node is one [`node::RaftNode`], a deterministic state machine with
//! no I/O besides its own [`storage::LogStore`]. The [`runtime`] drives it
//! from a single tokio task, so term, vote and log are only ever changed
//! from one place, and feeds committed entries to a separate applier task
//! that updates the [`store::FileStore`]. Nodes share nothing; everything
//! goes through a [`transport::Transport`].
//!
//! # Modules
//!
//! - [`node`]: elections, replication and the commit rule
//! - [`log`], [`storage`]: the replicated log and its durable storage
//! - [`store`], [`lease`], [`blob`]: the replicated file state machine
//! - [`runtime`]: worker and applier tasks, [`runtime::NodeHandle`]
//! - [`transport`]: in-memory (fault-injecting) and TCP transports
//! - [`client`]: leader-following gateway
//! - [`cluster`]: in-process clusters for demos and tests
//! - [`protocol`], [`cli`]: the operator console and command line

pub mod blob;
pub mod cli;
pub mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod error;
pub mod lease;
pub mod log;
pub mod message;
pub mod node;
pub mod protocol;
pub mod runtime;
pub mod storage;
pub mod store;
pub mod topology;
pub mod transport;

pub use error::{Error, Result};
