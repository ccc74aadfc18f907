use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::ClientId;
use crate::message::{Index, NodeId, Term};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the consensus engine, the runtime and the gateway.
#[derive(Debug, Error)]
pub enum Error {
    /// The receiving node is not the leader. `leader_hint` is the leader it
    /// currently follows, if any.
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("stale term {received}, current term is {current}")]
    StaleTerm { current: Term, received: Term },

    #[error("log mismatch at index {index}: leader has term {expected}, found {found:?}")]
    LogInconsistency {
        index: Index,
        expected: Term,
        found: Option<Term>,
    },

    #[error("proposal was not committed in time")]
    QuorumTimeout,

    #[error(transparent)]
    File(#[from] FileError),

    #[error("cannot compact up to {index}, only {applied} applied")]
    CompactionAhead { index: Index, applied: Index },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unexpected result: {0}")]
    Unexpected(String),

    #[error("node has shut down")]
    Shutdown,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether a gateway should retry the request, possibly elsewhere.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::NotLeader { .. } | Error::QuorumTimeout)
    }
}

/// Application-level outcomes of applying an operation.
///
/// These are part of the replicated result: every replica computes the same
/// one for a given entry, so they are plain data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum FileError {
    #[error("{path} already exists")]
    AlreadyExists { path: String },

    #[error("{path} not found")]
    NotFound { path: String },

    #[error("{path} is at version {actual}, expected {expected}")]
    VersionConflict {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("{path} requires a lease to be modified")]
    LeaseRequired { path: String },

    #[error("{path} is leased to {holder:?}")]
    NotLeaseHolder {
        path: String,
        holder: Option<ClientId>,
    },
}
