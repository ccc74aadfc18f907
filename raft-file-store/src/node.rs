//! Core Raft node implementation.
//!
//! [`RaftNode`] is a deterministic, single-threaded state machine. It is
//! driven from the outside by three calls:
//!
//! - `tick()` advances the logical clock (election and heartbeat timers),
//! - `step()` processes one inbound message,
//! - `propose()` appends a client operation on the leader.
//!
//! Reads go through `read_index()`: the leader notes its commit index and
//! only confirms it, as a [`ReadState`], once a quorum has answered a
//! heartbeat round sent after the request. A deposed leader can never
//! gather that quorum, so it cannot serve a stale read.
//!
//! None of them perform I/O other than writing the node's own log store.
//! Outbound messages and newly committed entries accumulate inside the node
//! and are drained with `poll_ready()`, which keeps the node usable both from
//! the async runtime and from synchronous tests that route messages by hand.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::command::Operation;
use crate::config::{RaftConfig, Ticks};
use crate::error::{Error, Result};
use crate::log::{now_millis, Log, LogEntry, Timestamp};
use crate::message::{Envelope, Index, Message, NodeId, Term};
use crate::storage::LogStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Replication progress of one follower, tracked by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Next entry to send.
    pub next_index: Index,
    /// Highest entry known to be replicated.
    pub match_index: Index,
    /// A non-empty AppendEntries is outstanding.
    inflight: bool,
    /// Highest heartbeat round this follower has answered in our term.
    acked_round: u64,
}

enum RoleState {
    Follower { leader: Option<NodeId> },
    Candidate { votes: HashSet<NodeId> },
    Leader { progress: HashMap<NodeId, Progress> },
}

/// Where a proposal landed in the leader's log. The proposal succeeded only
/// if the entry committed at `index` still has `term`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub index: Index,
    pub term: Term,
}

/// A confirmed read: once `index` is applied locally, state reflects every
/// write acknowledged before the read with id `ctx` was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadState {
    pub ctx: u64,
    pub index: Index,
}

/// A read waiting for a quorum to answer heartbeat `round`.
#[derive(Debug)]
struct PendingRead {
    ctx: u64,
    index: Index,
    round: u64,
    since: u64,
}

/// The body of an AppendEntries, as handled by a follower.
struct AppendRequest {
    prev_log_index: Index,
    prev_log_term: Term,
    entries: Vec<LogEntry>,
    leader_commit: Index,
    round: u64,
}

/// Output accumulated since the last `poll_ready()`.
#[derive(Debug, Default)]
pub struct Ready {
    /// Messages for other nodes.
    pub messages: Vec<Envelope>,
    /// Newly committed entries, in log order, to be applied.
    pub committed: Vec<LogEntry>,
    /// Reads confirmed by a quorum.
    pub read_states: Vec<ReadState>,
}

/// Point-in-time view of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: Index,
    pub last_applied: Index,
    pub last_log_index: Index,
}

/// A Raft consensus node.
pub struct RaftNode<S: LogStore> {
    id: NodeId,
    peers: Vec<NodeId>,
    config: RaftConfig,
    log: Log<S>,
    state: RoleState,
    commit_index: Index,
    /// Highest index handed out through `poll_ready()`.
    last_applied: Index,
    clock: u64,
    election_elapsed: Ticks,
    election_timeout: Ticks,
    heartbeat_elapsed: Ticks,
    /// Heartbeat round of the current leadership.
    round: u64,
    pending_reads: Vec<PendingRead>,
    read_states: Vec<ReadState>,
    outbox: Vec<Envelope>,
    rng: StdRng,
}

impl<S: LogStore> RaftNode<S> {
    /// Opens a node on top of `store`, starting as a leaderless follower.
    /// Term, vote and log are restored from the store.
    pub fn new(id: NodeId, peers: Vec<NodeId>, store: S, config: RaftConfig) -> Result<Self> {
        config.validate()?;
        if peers.contains(&id) {
            return Err(Error::InvalidConfig(format!("node {id} lists itself as a peer")));
        }
        let log = Log::open(store)?;
        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let election_timeout = rng.gen_range(config.election_timeout.clone());
        info!(
            node = id,
            term = log.term(),
            last_index = log.last_index(),
            "raft node started"
        );
        Ok(Self {
            id,
            peers,
            config,
            log,
            state: RoleState::Follower { leader: None },
            commit_index: 0,
            last_applied: 0,
            clock: 0,
            election_elapsed: 0,
            election_timeout,
            heartbeat_elapsed: 0,
            round: 0,
            pending_reads: Vec::new(),
            read_states: Vec::new(),
            outbox: Vec::new(),
            rng,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        match self.state {
            RoleState::Follower { .. } => Role::Follower,
            RoleState::Candidate { .. } => Role::Candidate,
            RoleState::Leader { .. } => Role::Leader,
        }
    }

    pub fn term(&self) -> Term {
        self.log.term()
    }

    /// The leader this node believes in, itself included.
    pub fn leader_id(&self) -> Option<NodeId> {
        match &self.state {
            RoleState::Follower { leader } => *leader,
            RoleState::Candidate { .. } => None,
            RoleState::Leader { .. } => Some(self.id),
        }
    }

    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    pub fn last_applied(&self) -> Index {
        self.last_applied
    }

    pub fn log(&self) -> &Log<S> {
        &self.log
    }

    /// Replication progress of `peer`, if this node leads.
    pub fn progress(&self, peer: NodeId) -> Option<Progress> {
        match &self.state {
            RoleState::Leader { progress } => progress.get(&peer).copied(),
            _ => None,
        }
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            role: self.role(),
            term: self.term(),
            leader: self.leader_id(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
        }
    }

    fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Advances the logical clock by one tick.
    pub fn tick(&mut self) {
        self.clock += 1;
        match self.state {
            RoleState::Leader { .. } => {
                self.expire_reads();
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= self.config.heartbeat_interval {
                    self.heartbeat_elapsed = 0;
                    self.broadcast_append();
                }
            }
            RoleState::Follower { .. } | RoleState::Candidate { .. } => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.election_timeout {
                    if let Err(err) = self.campaign() {
                        error!(node = self.id, error = %err, "failed to start election");
                    }
                }
            }
        }
    }

    /// Starts an election in the next term, whatever the current role.
    pub fn campaign(&mut self) -> Result<()> {
        let term = self.log.term() + 1;
        if let Err(err) = self.log.set_term_and_vote(term, Some(self.id)) {
            self.reset_election_timer();
            return Err(err);
        }
        info!(node = self.id, term, "starting election");
        self.pending_reads.clear();
        self.state = RoleState::Candidate {
            votes: HashSet::from([self.id]),
        };
        self.reset_election_timer();

        if self.quorum_size() == 1 {
            self.become_leader();
            return Ok(());
        }
        let (last_log_index, last_log_term) = (self.log.last_index(), self.log.last_term());
        for i in 0..self.peers.len() {
            let peer = self.peers[i];
            self.send(
                peer,
                Message::RequestVote {
                    term,
                    candidate_id: self.id,
                    last_log_index,
                    last_log_term,
                },
            );
        }
        Ok(())
    }

    /// Appends an operation to the leader's log and starts replicating it.
    pub fn propose(&mut self, command: Operation, timestamp: Timestamp) -> Result<Proposal> {
        if !matches!(self.state, RoleState::Leader { .. }) {
            return Err(Error::NotLeader {
                leader_hint: self.leader_id(),
            });
        }
        let index = self.log.append(timestamp, Some(command))?;
        let term = self.log.term();
        debug!(node = self.id, index, term, "proposed entry");

        for i in 0..self.peers.len() {
            let peer = self.peers[i];
            if self.progress(peer).is_some_and(|p| !p.inflight) {
                self.send_append(peer);
            }
        }
        self.maybe_commit();
        Ok(Proposal { index, term })
    }

    /// Starts a read identified by `ctx`.
    ///
    /// Only a leader that has committed an entry in its own term accepts
    /// the read. It records its commit index and sends a heartbeat round;
    /// the matching [`ReadState`] shows up in [`Ready`] once a quorum has
    /// answered that round. Reads still unconfirmed after the longest
    /// election timeout are dropped.
    pub fn read_index(&mut self, ctx: u64) -> Result<()> {
        if !matches!(self.state, RoleState::Leader { .. }) {
            return Err(Error::NotLeader {
                leader_hint: self.leader_id(),
            });
        }
        if self.log.term_at(self.commit_index) != Some(self.log.term()) {
            return Err(Error::QuorumTimeout);
        }
        let index = self.commit_index;
        if self.quorum_size() == 1 {
            self.read_states.push(ReadState { ctx, index });
            return Ok(());
        }
        self.pending_reads.push(PendingRead {
            ctx,
            index,
            round: self.round + 1,
            since: self.clock,
        });
        self.broadcast_append();
        Ok(())
    }

    /// Confirms every pending read whose round a quorum has answered.
    fn advance_reads(&mut self) {
        if self.pending_reads.is_empty() {
            return;
        }
        let RoleState::Leader { progress } = &self.state else {
            return;
        };
        let quorum = self.quorum_size();
        let mut acked: Vec<u64> = progress.values().map(|p| p.acked_round).collect();
        acked.sort_unstable_by(|a, b| b.cmp(a));
        // The leader counts itself, so a quorum needs `quorum - 1` peers.
        let confirmed = acked.get(quorum - 2).copied().unwrap_or(0);
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_reads)
            .into_iter()
            .partition(|r| r.round <= confirmed);
        self.pending_reads = waiting;
        self.read_states
            .extend(ready.into_iter().map(|r| ReadState { ctx: r.ctx, index: r.index }));
    }

    fn expire_reads(&mut self) {
        let limit = u64::from(self.config.election_timeout.end);
        let clock = self.clock;
        let before = self.pending_reads.len();
        self.pending_reads.retain(|r| clock - r.since < limit);
        let expired = before - self.pending_reads.len();
        if expired > 0 {
            warn!(node = self.id, expired, "reads not confirmed by a quorum in time");
        }
    }

    /// Log compaction hook. Entries up to `index` must already be applied.
    pub fn compact_up_to(&mut self, index: Index) -> Result<()> {
        if index > self.last_applied {
            return Err(Error::CompactionAhead {
                index,
                applied: self.last_applied,
            });
        }
        self.log.compact_up_to(index)
    }

    /// Drains outbound messages and newly committed entries.
    pub fn poll_ready(&mut self) -> Option<Ready> {
        let committed = if self.commit_index > self.last_applied {
            let entries = self.log.range(self.last_applied + 1, self.commit_index).to_vec();
            self.last_applied = self.commit_index;
            entries
        } else {
            Vec::new()
        };
        if committed.is_empty() && self.outbox.is_empty() && self.read_states.is_empty() {
            return None;
        }
        Some(Ready {
            messages: std::mem::take(&mut self.outbox),
            committed,
            read_states: std::mem::take(&mut self.read_states),
        })
    }

    /// Processes a message from a peer.
    ///
    /// An error means the node could not persist the state the reply
    /// depends on; no reply is sent in that case.
    pub fn step(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope { from, to, message } = envelope;
        if to != self.id {
            warn!(node = self.id, to, "dropping misaddressed message");
            return Ok(());
        }
        debug!(node = self.id, peer = from, kind = message.kind(), term = message.term(), "step");

        let term = message.term();
        if term > self.log.term() {
            let leader = match &message {
                Message::AppendEntries { leader_id, .. } => Some(*leader_id),
                _ => None,
            };
            info!(
                node = self.id,
                peer = from,
                term,
                previous = self.log.term(),
                "observed higher term"
            );
            self.log.set_term_and_vote(term, None)?;
            self.become_follower(leader);
        }
        if term < self.log.term() {
            self.reject_stale(from, message);
            return Ok(());
        }

        match message {
            Message::RequestVote {
                candidate_id,
                last_log_index,
                last_log_term,
                ..
            } => self.handle_request_vote(from, candidate_id, last_log_index, last_log_term),
            Message::RequestVoteReply { granted, .. } => {
                self.handle_vote_reply(from, granted);
                Ok(())
            }
            Message::AppendEntries {
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                round,
                ..
            } => self.handle_append_entries(
                from,
                leader_id,
                AppendRequest {
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                    round,
                },
            ),
            Message::AppendEntriesReply {
                success,
                match_index,
                round,
                ..
            } => {
                self.handle_append_reply(from, success, match_index, round);
                Ok(())
            }
        }
    }

    /// Answers requests from an older term so the sender learns it is stale.
    fn reject_stale(&mut self, from: NodeId, message: Message) {
        let current = self.log.term();
        let err = Error::StaleTerm {
            current,
            received: message.term(),
        };
        debug!(node = self.id, peer = from, kind = message.kind(), error = %err, "rejecting");
        match message {
            Message::RequestVote { .. } => self.send(
                from,
                Message::RequestVoteReply {
                    term: current,
                    granted: false,
                },
            ),
            Message::AppendEntries { round, .. } => self.send(
                from,
                Message::AppendEntriesReply {
                    term: current,
                    success: false,
                    match_index: 0,
                    round,
                },
            ),
            Message::RequestVoteReply { .. } | Message::AppendEntriesReply { .. } => {}
        }
    }

    fn handle_request_vote(
        &mut self,
        from: NodeId,
        candidate_id: NodeId,
        last_log_index: Index,
        last_log_term: Term,
    ) -> Result<()> {
        let term = self.log.term();
        let free = self.log.voted_for().map_or(true, |v| v == candidate_id);
        let granted = free && self.log.is_up_to_date(last_log_index, last_log_term);
        if granted {
            self.log.set_term_and_vote(term, Some(candidate_id))?;
            self.reset_election_timer();
            info!(node = self.id, term, candidate = candidate_id, "granted vote");
        } else {
            debug!(
                node = self.id,
                term,
                candidate = candidate_id,
                voted_for = ?self.log.voted_for(),
                "refused vote"
            );
        }
        self.send(from, Message::RequestVoteReply { term, granted });
        Ok(())
    }

    fn handle_vote_reply(&mut self, from: NodeId, granted: bool) {
        let quorum = self.quorum_size();
        let RoleState::Candidate { votes } = &mut self.state else {
            return;
        };
        if granted {
            votes.insert(from);
        }
        if votes.len() >= quorum {
            self.become_leader();
        }
    }

    fn handle_append_entries(
        &mut self,
        from: NodeId,
        leader_id: NodeId,
        request: AppendRequest,
    ) -> Result<()> {
        let AppendRequest {
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
            round,
        } = request;
        if matches!(self.state, RoleState::Leader { .. }) {
            error!(
                node = self.id,
                peer = leader_id,
                term = self.log.term(),
                "another leader claims this term, ignoring"
            );
            return Ok(());
        }
        self.become_follower(Some(leader_id));
        let term = self.log.term();

        match self.log.term_at(prev_log_index) {
            Some(found) if found == prev_log_term => {}
            found => {
                let err = Error::LogInconsistency {
                    index: prev_log_index,
                    expected: prev_log_term,
                    found,
                };
                let hint = self.conflict_hint(prev_log_index, found);
                debug!(node = self.id, peer = from, error = %err, hint, "rejecting entries");
                self.send(
                    from,
                    Message::AppendEntriesReply {
                        term,
                        success: false,
                        match_index: hint,
                        round,
                    },
                );
                return Ok(());
            }
        }

        let last_new = prev_log_index + entries.len() as Index;
        if let Some(index) = self.log.splice(entries)? {
            assert!(
                index > self.commit_index,
                "node {} replaced committed entry {index}",
                self.id
            );
            info!(node = self.id, index, "discarded conflicting entries");
        }
        if leader_commit > self.commit_index {
            let commit = leader_commit.min(last_new);
            if commit > self.commit_index {
                self.commit_index = commit;
                debug!(node = self.id, commit_index = commit, "advanced commit index");
            }
        }
        self.send(
            from,
            Message::AppendEntriesReply {
                term,
                success: true,
                match_index: last_new,
                round,
            },
        );
        Ok(())
    }

    /// The last index the leader should assume matches after a rejection
    /// at `prev_log_index`. Skips back over the whole conflicting term.
    fn conflict_hint(&self, prev_log_index: Index, found: Option<Term>) -> Index {
        match found {
            None => self.log.last_index(),
            Some(conflict) => {
                let mut index = prev_log_index - 1;
                while index > self.commit_index && self.log.term_at(index) == Some(conflict) {
                    index -= 1;
                }
                index
            }
        }
    }

    fn handle_append_reply(&mut self, from: NodeId, success: bool, match_index: Index, round: u64) {
        let last_index = self.log.last_index();
        let id = self.id;
        let RoleState::Leader { progress } = &mut self.state else {
            return;
        };
        let Some(pr) = progress.get_mut(&from) else {
            warn!(node = id, peer = from, "reply from unknown peer");
            return;
        };
        // A rejection in our term still acknowledges our leadership.
        pr.acked_round = pr.acked_round.max(round);
        pr.inflight = false;

        if success {
            pr.match_index = pr.match_index.max(match_index);
            pr.next_index = pr.next_index.max(match_index + 1);
            let behind = pr.next_index <= last_index;
            self.maybe_commit();
            if behind {
                self.send_append(from);
            }
        } else {
            let next = (pr.next_index - 1)
                .min(match_index + 1)
                .max(pr.match_index + 1)
                .max(1);
            debug!(node = id, peer = from, next_index = next, "follower rejected, backing off");
            pr.next_index = next;
            self.send_append(from);
        }
        self.advance_reads();
    }

    fn become_follower(&mut self, leader: Option<NodeId>) {
        let changed = match &self.state {
            RoleState::Follower { leader: current } => *current != leader,
            _ => true,
        };
        if changed {
            info!(
                node = self.id,
                term = self.log.term(),
                from = ?self.role(),
                ?leader,
                "became follower"
            );
        }
        self.pending_reads.clear();
        self.state = RoleState::Follower { leader };
        self.reset_election_timer();
    }

    fn become_leader(&mut self) {
        info!(node = self.id, term = self.log.term(), "became leader");
        let next_index = self.log.last_index() + 1;
        let progress = self
            .peers
            .iter()
            .map(|peer| {
                let pr = Progress {
                    next_index,
                    match_index: 0,
                    inflight: false,
                    acked_round: 0,
                };
                (*peer, pr)
            })
            .collect();
        self.state = RoleState::Leader { progress };
        self.heartbeat_elapsed = 0;
        self.round = 0;

        // Entries from earlier terms only commit through an entry of ours.
        if let Err(err) = self.log.append(now_millis(), None) {
            error!(node = self.id, error = %err, "failed to append leader barrier, stepping down");
            self.become_follower(None);
            return;
        }
        self.broadcast_append();
        self.maybe_commit();
    }

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        self.election_timeout = self.rng.gen_range(self.config.election_timeout.clone());
    }

    /// Sends every peer an AppendEntries in a new heartbeat round.
    fn broadcast_append(&mut self) {
        self.round += 1;
        for i in 0..self.peers.len() {
            let peer = self.peers[i];
            self.send_append(peer);
        }
    }

    /// Sends `peer` everything from its next index on, or a heartbeat if it
    /// is caught up.
    fn send_append(&mut self, peer: NodeId) {
        let RoleState::Leader { progress } = &mut self.state else {
            return;
        };
        let Some(pr) = progress.get_mut(&peer) else {
            return;
        };
        let prev_log_index = pr.next_index - 1;
        let Some(prev_log_term) = self.log.term_at(prev_log_index) else {
            error!(node = self.id, peer, prev_log_index, "next index beyond log");
            return;
        };
        let entries = self
            .log
            .entries_from(pr.next_index, self.config.max_append_entries);
        if !entries.is_empty() {
            pr.inflight = true;
        }
        self.outbox.push(Envelope {
            from: self.id,
            to: peer,
            message: Message::AppendEntries {
                term: self.log.term(),
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
                round: self.round,
            },
        });
    }

    /// Commits the highest index stored on a quorum, if it is from the
    /// current term.
    fn maybe_commit(&mut self) {
        let RoleState::Leader { progress } = &self.state else {
            return;
        };
        let mut matched: Vec<Index> = progress.values().map(|p| p.match_index).collect();
        matched.push(self.log.last_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let quorum_index = matched[self.quorum_size() - 1];

        if quorum_index > self.commit_index
            && self.log.term_at(quorum_index) == Some(self.log.term())
        {
            self.commit_index = quorum_index;
            debug!(node = self.id, commit_index = quorum_index, "advanced commit index");
        }
    }

    fn send(&mut self, to: NodeId, message: Message) {
        self.outbox.push(Envelope {
            from: self.id,
            to,
            message,
        });
    }
}
