//! Async runtime for a single node.
//!
//! A node runs as two tokio tasks:
//!
//! - **Worker**: owns the [`RaftNode`] and is the only code that touches it.
//!   It selects over client requests, inbound messages and a tick interval,
//!   then drains the node's `Ready` output: messages go to the transport,
//!   committed entries go to the applier.
//! - **Applier**: applies committed entries to the shared [`FileStore`] in
//!   log order and answers the clients waiting on them.
//!
//! Replication never waits on apply, and apply never blocks message
//! handling. Callers talk to the node through a cloneable [`NodeHandle`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::blob::BlobStore;
use crate::command::Operation;
use crate::config::{NodeConfig, ReadConsistency};
use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::log::{now_millis, LogEntry};
use crate::message::{Index, NodeId};
use crate::node::{NodeStatus, Proposal, RaftNode, Role};
use crate::storage::LogStore;
use crate::store::{ApplyOutcome, FileContent, FileStore, FileVersion};
use crate::transport::{Inbox, Transport};

/// Pause before retrying an entry whose content could not be stored.
const APPLY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    requests: mpsc::Sender<Request>,
    store: Arc<RwLock<FileStore>>,
    applied: watch::Receiver<Index>,
    status: watch::Receiver<NodeStatus>,
    read_consistency: ReadConsistency,
    proposal_timeout: Duration,
}

enum Request {
    Propose {
        command: Operation,
        respond_to: oneshot::Sender<Result<ApplyOutcome>>,
    },
    ReadIndex {
        respond_to: oneshot::Sender<Result<Index>>,
    },
    Campaign {
        respond_to: oneshot::Sender<Result<()>>,
    },
    Compact {
        index: Index,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Request,
    ) -> Result<oneshot::Receiver<Result<T>>> {
        let (tx, rx) = oneshot::channel();
        self.requests.send(build(tx)).await.map_err(|_| Error::Shutdown)?;
        Ok(rx)
    }

    /// Replicates `command` and waits until it is applied on this node.
    ///
    /// Fails with `NotLeader` on followers, and with `QuorumTimeout` when
    /// the entry is not applied within the proposal timeout. An entry that
    /// timed out may still commit later.
    pub async fn propose(&self, command: Operation) -> Result<ApplyOutcome> {
        let rx = self
            .request(|respond_to| Request::Propose {
                command,
                respond_to,
            })
            .await?;
        match time::timeout(self.proposal_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::QuorumTimeout),
        }
    }

    /// Waits until every write acknowledged before the call is visible
    /// locally. A no-op under `Local` consistency.
    async fn read_barrier(&self) -> Result<()> {
        if self.read_consistency == ReadConsistency::Local {
            return Ok(());
        }
        let rx = self.request(|respond_to| Request::ReadIndex { respond_to }).await?;
        let index = match time::timeout(self.proposal_timeout, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(Error::Shutdown),
            Err(_) => return Err(Error::QuorumTimeout),
        };
        self.wait_for_applied(index, self.proposal_timeout).await
    }

    /// Waits until the state machine has applied `index`.
    pub async fn wait_for_applied(&self, index: Index, limit: Duration) -> Result<()> {
        let mut applied = self.applied.clone();
        let waited = time::timeout(limit, applied.wait_for(|a| *a >= index)).await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::QuorumTimeout),
        }
    }

    /// Latest content of `path`.
    pub async fn read(&self, path: &str) -> Result<FileContent> {
        self.read_barrier().await?;
        self.store.read().await.read(path)
    }

    /// Every version of `path`, deletions included.
    pub async fn history(&self, path: &str) -> Result<Vec<FileVersion>> {
        self.read_barrier().await?;
        Ok(self.store.read().await.history(path)?.to_vec())
    }

    /// Paths that currently exist.
    pub async fn list(&self) -> Result<Vec<String>> {
        self.read_barrier().await?;
        Ok(self.store.read().await.list())
    }

    /// The active lease on `path`, judged against the local clock.
    pub async fn lease(&self, path: &str) -> Result<Option<Lease>> {
        self.read_barrier().await?;
        let store = self.store.read().await;
        let now = now_millis().max(store.applied_timestamp());
        Ok(store.lease(path, now).cloned())
    }

    pub fn status(&self) -> NodeStatus {
        let mut status = self.status.borrow().clone();
        status.last_applied = *self.applied.borrow();
        status
    }

    /// Role, term and leader changes as they happen.
    pub fn subscribe_status(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    pub fn applied_index(&self) -> Index {
        *self.applied.borrow()
    }

    /// Starts an election on this node.
    pub async fn campaign(&self) -> Result<()> {
        let rx = self.request(|respond_to| Request::Campaign { respond_to }).await?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Invokes the log compaction hook up to `index`.
    pub async fn compact_up_to(&self, index: Index) -> Result<()> {
        let rx = self
            .request(|respond_to| Request::Compact { index, respond_to })
            .await?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Stops the node. Pending requests fail with `Shutdown`.
    pub async fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown).await;
    }
}

/// Background tasks of a spawned node.
pub struct NodeTasks {
    pub worker: JoinHandle<()>,
    pub applier: JoinHandle<()>,
}

/// Starts a node on the current tokio runtime.
///
/// `inbox` must receive every message the transport delivers to `config.id`.
pub fn spawn_node<S: LogStore>(
    config: NodeConfig,
    log_store: S,
    blobs: Arc<dyn BlobStore>,
    transport: Arc<dyn Transport>,
    inbox: Inbox,
) -> Result<(NodeHandle, NodeTasks)> {
    config.validate()?;
    let node = RaftNode::new(config.id, config.peers.clone(), log_store, config.raft.clone())?;
    let store = Arc::new(RwLock::new(FileStore::new(blobs, config.lease_policy)));

    let (requests_tx, requests_rx) = mpsc::channel(256);
    let (apply_tx, apply_rx) = mpsc::unbounded_channel();
    let (applied_tx, applied_rx) = watch::channel(0);
    let (status_tx, status_rx) = watch::channel(node.status());

    let applier = Applier {
        id: config.id,
        store: Arc::clone(&store),
        tasks: apply_rx,
        waiters: BTreeMap::new(),
        applied: applied_tx,
    };
    let worker = Worker {
        node,
        transport,
        requests: requests_rx,
        inbox,
        apply: apply_tx,
        status: status_tx,
        tick_interval: config.tick_interval,
        reads: HashMap::new(),
        next_read: 0,
    };

    let handle = NodeHandle {
        id: config.id,
        requests: requests_tx,
        store,
        applied: applied_rx,
        status: status_rx,
        read_consistency: config.read_consistency,
        proposal_timeout: config.proposal_timeout,
    };
    let tasks = NodeTasks {
        worker: tokio::spawn(worker.run()),
        applier: tokio::spawn(applier.run()),
    };
    Ok((handle, tasks))
}

enum ApplyTask {
    /// A client waits for the entry at this position.
    Register {
        proposal: Proposal,
        respond_to: oneshot::Sender<Result<ApplyOutcome>>,
    },
    Apply(Vec<LogEntry>),
    /// Leadership was lost; fail every waiter.
    Abort { leader_hint: Option<NodeId> },
}

struct Worker<S: LogStore> {
    node: RaftNode<S>,
    transport: Arc<dyn Transport>,
    requests: mpsc::Receiver<Request>,
    inbox: Inbox,
    apply: mpsc::UnboundedSender<ApplyTask>,
    status: watch::Sender<NodeStatus>,
    tick_interval: Duration,
    /// Reads waiting for the node to confirm them, by read id.
    reads: HashMap<u64, oneshot::Sender<Result<Index>>>,
    next_read: u64,
}

impl<S: LogStore> Worker<S> {
    async fn run(mut self) {
        let id = self.node.id();
        let mut ticker = time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.handle_request(request),
                },
                Some(envelope) = self.inbox.recv() => {
                    if let Err(err) = self.node.step(envelope) {
                        error!(node = id, error = %err, "failed to handle message");
                    }
                }
                _ = ticker.tick() => self.node.tick(),
            }
            self.process_ready();
            self.publish_status();
        }
        info!(node = id, "worker stopped");
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Propose {
                command,
                respond_to,
            } => match self.node.propose(command, now_millis()) {
                Ok(proposal) => {
                    let _ = self.apply.send(ApplyTask::Register {
                        proposal,
                        respond_to,
                    });
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                }
            },
            Request::ReadIndex { respond_to } => {
                self.next_read += 1;
                let ctx = self.next_read;
                match self.node.read_index(ctx) {
                    Ok(()) => {
                        self.reads.insert(ctx, respond_to);
                    }
                    Err(err) => {
                        let _ = respond_to.send(Err(err));
                    }
                }
            }
            Request::Campaign { respond_to } => {
                info!(node = self.node.id(), role = ?self.node.role(), "campaign requested");
                let _ = respond_to.send(self.node.campaign());
            }
            Request::Compact { index, respond_to } => {
                let _ = respond_to.send(self.node.compact_up_to(index));
            }
            Request::Shutdown => {}
        }
    }

    fn process_ready(&mut self) {
        while let Some(ready) = self.node.poll_ready() {
            for envelope in ready.messages {
                self.transport.send(envelope);
            }
            if !ready.committed.is_empty() {
                let _ = self.apply.send(ApplyTask::Apply(ready.committed));
            }
            for read in ready.read_states {
                if let Some(respond_to) = self.reads.remove(&read.ctx) {
                    let _ = respond_to.send(Ok(read.index));
                }
            }
        }
        // Readers that gave up no longer need an answer.
        self.reads.retain(|_, respond_to| !respond_to.is_closed());
    }

    fn publish_status(&mut self) {
        let status = self.node.status();
        let previous = self.status.borrow().clone();
        if status == previous {
            return;
        }
        if previous.role == Role::Leader && status.role != Role::Leader {
            warn!(
                node = status.id,
                term = status.term,
                "lost leadership, failing pending proposals"
            );
            let _ = self.apply.send(ApplyTask::Abort {
                leader_hint: status.leader,
            });
        }
        if status.role != Role::Leader || status.term != previous.term {
            for (_, respond_to) in self.reads.drain() {
                let _ = respond_to.send(Err(Error::NotLeader {
                    leader_hint: status.leader,
                }));
            }
        }
        self.status.send_replace(status);
    }
}

struct Waiter {
    term: u64,
    respond_to: oneshot::Sender<Result<ApplyOutcome>>,
}

struct Applier {
    id: NodeId,
    store: Arc<RwLock<FileStore>>,
    tasks: mpsc::UnboundedReceiver<ApplyTask>,
    waiters: BTreeMap<Index, Waiter>,
    applied: watch::Sender<Index>,
}

impl Applier {
    async fn run(mut self) {
        while let Some(task) = self.tasks.recv().await {
            match task {
                ApplyTask::Register {
                    proposal,
                    respond_to,
                } => {
                    self.waiters.insert(
                        proposal.index,
                        Waiter {
                            term: proposal.term,
                            respond_to,
                        },
                    );
                }
                ApplyTask::Apply(entries) => {
                    for entry in entries {
                        self.apply(entry).await;
                    }
                }
                ApplyTask::Abort { leader_hint } => {
                    for (_, waiter) in std::mem::take(&mut self.waiters) {
                        let _ = waiter.respond_to.send(Err(Error::NotLeader { leader_hint }));
                    }
                }
            }
        }
        debug!(node = self.id, "applier stopped");
    }

    async fn apply(&mut self, entry: LogEntry) {
        let outcome = loop {
            let result = self.store.write().await.apply(&entry);
            match result {
                Ok(outcome) => break outcome,
                Err(err) => {
                    error!(
                        node = self.id,
                        index = entry.index,
                        error = %err,
                        "apply failed, retrying"
                    );
                    time::sleep(APPLY_RETRY_DELAY).await;
                }
            }
        };
        self.applied.send_replace(entry.index);

        if let Some(waiter) = self.waiters.remove(&entry.index) {
            let reply = if waiter.term == entry.term {
                Ok(outcome)
            } else {
                Err(Error::NotLeader { leader_hint: None })
            };
            let _ = waiter.respond_to.send(reply);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::config::RaftConfig;
    use crate::storage::MemoryLogStore;
    use crate::store::OpResult;
    use crate::transport::MemoryNetwork;

    fn single_node() -> (NodeHandle, NodeTasks) {
        let network = MemoryNetwork::new();
        let inbox = network.register(1);
        let mut config = NodeConfig::new(1, vec![]);
        config.tick_interval = Duration::from_millis(5);
        config.raft = RaftConfig {
            rng_seed: Some(1),
            ..RaftConfig::default()
        };
        spawn_node(
            config,
            MemoryLogStore::new(),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(network),
            inbox,
        )
        .unwrap()
    }

    async fn wait_for_leader(handle: &NodeHandle) {
        let mut status = handle.subscribe_status();
        time::timeout(Duration::from_secs(5), status.wait_for(|s| s.role == Role::Leader))
            .await
            .expect("no leader in time")
            .unwrap();
    }

    #[tokio::test]
    async fn single_node_commits_and_reads() {
        let (handle, _tasks) = single_node();
        wait_for_leader(&handle).await;

        let outcome = handle
            .propose(Operation::CreateFile {
                path: "/a".into(),
                content: b"hello".to_vec(),
                writer: "test".into(),
            })
            .await
            .unwrap();
        assert_eq!(outcome.result, Ok(OpResult::Created { version: 1 }));
        assert_eq!(handle.read("/a").await.unwrap().content, b"hello");
        assert!(handle.status().last_applied >= outcome.index);
        handle.compact_up_to(outcome.index).await.unwrap();
    }

    #[tokio::test]
    async fn requests_fail_after_shutdown() {
        let (handle, tasks) = single_node();
        handle.shutdown().await;
        tasks.worker.await.unwrap();
        let err = handle.campaign().await.unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }
}
