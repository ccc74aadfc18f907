//! Consensus RPC messages exchanged between nodes.
//!
//! Every message carries the sender's term. Replies are ordinary messages
//! too: the transport never correlates a reply with its request, so a reply
//! is matched against the receiver's current state when it arrives and is
//! dropped if that state has moved on (different term or role).

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;

/// Identifies a node in the cluster.
pub type NodeId = u64;

/// An election epoch. Only ever increases on a node.
pub type Term = u64;

/// A 1-based log position. Index 0 means "before the first entry".
pub type Index = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// A candidate asks for a vote.
    RequestVote {
        term: Term,
        candidate_id: NodeId,
        last_log_index: Index,
        last_log_term: Term,
    },
    RequestVoteReply { term: Term, granted: bool },
    /// Replicates entries following `prev_log_index`. Empty `entries` is a
    /// heartbeat.
    AppendEntries {
        term: Term,
        leader_id: NodeId,
        prev_log_index: Index,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: Index,
        /// Leader-local counter of heartbeat rounds, echoed in the reply.
        round: u64,
    },
    /// On success `match_index` is the last index known to match the
    /// leader. On rejection it is the highest index the follower may still
    /// share with the leader, so the leader can skip back over a missing or
    /// conflicting suffix in one step.
    AppendEntriesReply {
        term: Term,
        success: bool,
        match_index: Index,
        round: u64,
    },
}

impl Message {
    pub fn term(&self) -> Term {
        match self {
            Message::RequestVote { term, .. }
            | Message::RequestVoteReply { term, .. }
            | Message::AppendEntries { term, .. }
            | Message::AppendEntriesReply { term, .. } => *term,
        }
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::RequestVote { .. } => "RequestVote",
            Message::RequestVoteReply { .. } => "RequestVoteReply",
            Message::AppendEntries { .. } => "AppendEntries",
            Message::AppendEntriesReply { .. } => "AppendEntriesReply",
        }
    }
}

/// An addressed message as handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub to: NodeId,
    pub message: Message,
}

impl Envelope {
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_is_read_from_every_variant() {
        let vote = Message::RequestVote {
            term: 4,
            candidate_id: 2,
            last_log_index: 9,
            last_log_term: 3,
        };
        let reply = Message::AppendEntriesReply {
            term: 7,
            success: false,
            match_index: 0,
            round: 3,
        };
        assert_eq!(vote.term(), 4);
        assert_eq!(reply.term(), 7);
        assert_eq!(vote.kind(), "RequestVote");
    }
}
