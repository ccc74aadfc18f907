//! Client gateway.
//!
//! [`Gateway`] turns file operations into proposals and finds the leader on
//! its own: it sends to the node it believes leads, follows `NotLeader`
//! hints, moves on to the next node when a node has no hint or is down, and
//! backs off exponentially between attempts. Application errors such as
//! `VersionConflict` are returned as-is, never retried.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::command::{ClientId, Operation};
use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::message::NodeId;
use crate::runtime::NodeHandle;
use crate::store::{ApplyOutcome, FileContent, FileVersion, OpResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: usize) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_backoff);
        let jitter = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
        exp + Duration::from_millis(jitter)
    }
}

pub struct Gateway {
    client_id: ClientId,
    nodes: BTreeMap<NodeId, NodeHandle>,
    leader: Mutex<Option<NodeId>>,
    retry: RetryPolicy,
}

impl Gateway {
    pub fn new(
        client_id: impl Into<ClientId>,
        nodes: impl IntoIterator<Item = NodeHandle>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            nodes: nodes.into_iter().map(|h| (h.id(), h)).collect(),
            leader: Mutex::new(None),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The node currently believed to lead.
    pub fn leader(&self) -> Option<NodeId> {
        *self.leader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_leader(&self, leader: Option<NodeId>) {
        *self.leader.lock().unwrap_or_else(PoisonError::into_inner) = leader;
    }

    /// The node after `current` in id order, wrapping around.
    fn next_node(&self, current: Option<NodeId>) -> Option<NodeId> {
        let after = current.and_then(|c| self.nodes.range(c + 1..).next().map(|(id, _)| *id));
        after.or_else(|| self.nodes.keys().next().copied())
    }

    /// Runs `call` against the leader, redirecting and retrying as needed.
    async fn with_leader<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut(NodeHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut target = self.leader().or_else(|| self.next_node(None));
        let mut last_err = Error::NotLeader { leader_hint: None };
        for attempt in 0..self.retry.max_attempts {
            let Some(id) = target else {
                break;
            };
            let handle = self.nodes[&id].clone();
            match call(handle).await {
                Ok(value) => {
                    self.set_leader(Some(id));
                    return Ok(value);
                }
                Err(Error::NotLeader {
                    leader_hint: Some(hint),
                }) if hint != id && self.nodes.contains_key(&hint) => {
                    debug!(node = id, hint, attempt, "redirected to leader");
                    target = Some(hint);
                    last_err = Error::NotLeader {
                        leader_hint: Some(hint),
                    };
                    // Follow a fresh hint at once; only back off on repeats.
                    if attempt > 0 {
                        tokio::time::sleep(self.retry.backoff(attempt)).await;
                    }
                    continue;
                }
                Err(err) if err.is_retryable() || matches!(err, Error::Shutdown) => {
                    debug!(node = id, error = %err, attempt, "retrying on another node");
                    self.set_leader(None);
                    target = self.next_node(Some(id));
                    last_err = err;
                }
                Err(err) => return Err(err),
            }
            tokio::time::sleep(self.retry.backoff(attempt)).await;
        }
        Err(last_err)
    }

    /// Proposes `command` and returns its outcome from the leader.
    pub async fn propose(&self, command: Operation) -> Result<ApplyOutcome> {
        self.with_leader(|node| {
            let command = command.clone();
            async move { node.propose(command).await }
        })
        .await
    }

    async fn submit(&self, command: Operation) -> Result<OpResult> {
        Ok(self.propose(command).await?.result?)
    }

    pub async fn create(&self, path: &str, content: impl Into<Vec<u8>>) -> Result<u64> {
        let command = Operation::CreateFile {
            path: path.to_string(),
            content: content.into(),
            writer: self.client_id.clone(),
        };
        match self.submit(command).await? {
            OpResult::Created { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    pub async fn write(
        &self,
        path: &str,
        content: impl Into<Vec<u8>>,
        expected_version: u64,
    ) -> Result<u64> {
        let command = Operation::WriteFile {
            path: path.to_string(),
            content: content.into(),
            expected_version,
            writer: self.client_id.clone(),
        };
        match self.submit(command).await? {
            OpResult::Written { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete(&self, path: &str) -> Result<u64> {
        let command = Operation::DeleteFile {
            path: path.to_string(),
            writer: self.client_id.clone(),
        };
        match self.submit(command).await? {
            OpResult::Deleted { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }

    pub async fn acquire_lease(&self, path: &str, duration: Duration) -> Result<Lease> {
        let command = Operation::AcquireLease {
            path: path.to_string(),
            holder: self.client_id.clone(),
            duration,
        };
        match self.submit(command).await? {
            OpResult::LeaseGranted(lease) => Ok(lease),
            other => Err(unexpected(other)),
        }
    }

    pub async fn release_lease(&self, path: &str) -> Result<()> {
        let command = Operation::ReleaseLease {
            path: path.to_string(),
            holder: self.client_id.clone(),
        };
        self.submit(command).await.map(|_| ())
    }

    pub async fn read(&self, path: &str) -> Result<FileContent> {
        self.with_leader(|node| {
            let path = path.to_string();
            async move { node.read(&path).await }
        })
        .await
    }

    pub async fn history(&self, path: &str) -> Result<Vec<FileVersion>> {
        self.with_leader(|node| {
            let path = path.to_string();
            async move { node.history(&path).await }
        })
        .await
    }
}

fn unexpected(result: OpResult) -> Error {
    Error::Unexpected(format!("{result:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let retry = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
        };
        let first = retry.backoff(0);
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(15));
        let late = retry.backoff(10);
        assert!(late >= Duration::from_millis(100) && late <= Duration::from_millis(150));
    }
}
