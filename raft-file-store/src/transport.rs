//! Message delivery between nodes.
//!
//! The consensus engine only needs fire-and-forget delivery: [`Transport::send`]
//! never blocks and never reports failure. Each node receives on its own
//! unbounded inbox. Two transports are provided:
//!
//! - [`MemoryNetwork`]: in-process delivery with injectable faults
//!   (partitions, isolation, drops, duplicates, latency).
//! - [`TcpTransport`]: length-prefixed bincode frames over TCP, one
//!   connection per message.

use std::collections::{HashMap, HashSet};
use std::io;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::message::{Envelope, NodeId};

/// Frames larger than this are rejected as corrupt.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub type Inbox = mpsc::UnboundedReceiver<Envelope>;

pub trait Transport: Send + Sync + 'static {
    /// Sends a message. Delivery is not guaranteed.
    fn send(&self, envelope: Envelope);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStats {
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct NetworkState {
    inboxes: HashMap<NodeId, mpsc::UnboundedSender<Envelope>>,
    isolated: HashSet<NodeId>,
    /// Directed links that drop everything.
    cut: HashSet<(NodeId, NodeId)>,
    drop_rate: f64,
    duplicate_rate: f64,
    latency: Option<Range<Duration>>,
}

/// In-process network with fault injection. Clones share the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a node and returns its inbox. Re-registering replaces the
    /// previous inbox, as a restarted node would.
    pub fn register(&self, id: NodeId) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().inboxes.insert(id, tx);
        rx
    }

    /// Detaches a node; messages to it are dropped.
    pub fn unregister(&self, id: NodeId) {
        self.state().inboxes.remove(&id);
    }

    /// Drops every message to or from `id`.
    pub fn isolate(&self, id: NodeId) {
        self.state().isolated.insert(id);
    }

    /// Cuts all links between the two groups, in both directions.
    pub fn partition(&self, left: &[NodeId], right: &[NodeId]) {
        let mut state = self.state();
        for &a in left {
            for &b in right {
                state.cut.insert((a, b));
                state.cut.insert((b, a));
            }
        }
    }

    /// Removes every isolation and partition.
    pub fn heal(&self) {
        let mut state = self.state();
        state.isolated.clear();
        state.cut.clear();
    }

    pub fn set_drop_rate(&self, rate: f64) {
        self.state().drop_rate = rate.clamp(0.0, 1.0);
    }

    pub fn set_duplicate_rate(&self, rate: f64) {
        self.state().duplicate_rate = rate.clamp(0.0, 1.0);
    }

    /// Delays every message by a duration drawn from `latency`. Delayed
    /// messages may overtake each other.
    pub fn set_latency(&self, latency: Option<Range<Duration>>) {
        self.state().latency = latency.filter(|r| !r.is_empty());
    }

    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn drop_message(&self, envelope: &Envelope, reason: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(
            from = envelope.from,
            to = envelope.to,
            kind = envelope.message.kind(),
            reason,
            "dropped message"
        );
    }
}

impl Transport for MemoryNetwork {
    fn send(&self, envelope: Envelope) {
        let (inbox, copies, delay) = {
            let state = self.state();
            let (from, to) = (envelope.from, envelope.to);
            if state.isolated.contains(&from)
                || state.isolated.contains(&to)
                || state.cut.contains(&(from, to))
            {
                drop(state);
                self.drop_message(&envelope, "partitioned");
                return;
            }
            let mut rng = rand::thread_rng();
            if state.drop_rate > 0.0 && rng.gen_bool(state.drop_rate) {
                drop(state);
                self.drop_message(&envelope, "random drop");
                return;
            }
            let Some(inbox) = state.inboxes.get(&to).cloned() else {
                drop(state);
                self.drop_message(&envelope, "unknown node");
                return;
            };
            let copies = if state.duplicate_rate > 0.0 && rng.gen_bool(state.duplicate_rate) {
                2
            } else {
                1
            };
            let delay = state.latency.clone().map(|r| rng.gen_range(r));
            (inbox, copies, delay)
        };

        for _ in 0..copies {
            let envelope = envelope.clone();
            match delay {
                Some(delay) => {
                    let delivered = Arc::clone(&self.delivered);
                    let inbox = inbox.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if inbox.send(envelope).is_ok() {
                            delivered.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                }
                None => {
                    if inbox.send(envelope).is_ok() {
                        self.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }
}

/// TCP transport. Every message opens a connection, writes one frame
/// (`u32` big-endian length, then the bincode envelope) and closes it.
pub struct TcpTransport {
    addresses: HashMap<NodeId, String>,
}

impl TcpTransport {
    pub fn new(addresses: HashMap<NodeId, String>) -> Self {
        Self { addresses }
    }

    /// Binds `addr` and forwards every received frame to `inbox`.
    pub async fn listen(
        addr: &str,
        inbox: mpsc::UnboundedSender<Envelope>,
    ) -> Result<(JoinHandle<()>, std::net::SocketAddr)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let inbox = inbox.clone();
                        tokio::spawn(async move {
                            if let Err(err) = read_frames(stream, inbox).await {
                                debug!(%peer, error = %err, "connection error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "accept error"),
                }
            }
        });
        Ok((task, local))
    }
}

impl Transport for TcpTransport {
    fn send(&self, envelope: Envelope) {
        let Some(addr) = self.addresses.get(&envelope.to).cloned() else {
            warn!(to = envelope.to, "no address for peer, dropping message");
            return;
        };
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "failed to encode message");
                return;
            }
        };
        tokio::spawn(async move {
            if let Err(err) = write_frame(&addr, &bytes).await {
                debug!(%addr, error = %err, "failed to send message");
            }
        });
    }
}

async fn write_frame(addr: &str, bytes: &[u8]) -> io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.shutdown().await
}

async fn read_frames(mut stream: TcpStream, inbox: mpsc::UnboundedSender<Envelope>) -> Result<()> {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            let err = io::Error::new(io::ErrorKind::InvalidData, format!("frame of {len} bytes"));
            return Err(err.into());
        }
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        let envelope = Envelope::decode(&buf)?;
        if inbox.send(envelope).is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn heartbeat(from: NodeId, to: NodeId) -> Envelope {
        Envelope {
            from,
            to,
            message: Message::AppendEntries {
                term: 1,
                leader_id: from,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
                round: 1,
            },
        }
    }

    #[tokio::test]
    async fn memory_network_delivers_to_registered_nodes() {
        let network = MemoryNetwork::new();
        let mut inbox = network.register(2);
        network.send(heartbeat(1, 2));
        network.send(heartbeat(1, 3));
        assert_eq!(inbox.recv().await.unwrap(), heartbeat(1, 2));
        assert_eq!(network.stats(), NetworkStats { delivered: 1, dropped: 1 });
    }

    #[tokio::test]
    async fn partitions_drop_both_directions_until_healed() {
        let network = MemoryNetwork::new();
        let mut one = network.register(1);
        let mut two = network.register(2);
        network.partition(&[1], &[2]);
        network.send(heartbeat(1, 2));
        network.send(heartbeat(2, 1));
        assert!(two.try_recv().is_err());
        assert!(one.try_recv().is_err());

        network.heal();
        network.send(heartbeat(2, 1));
        assert_eq!(one.recv().await.unwrap().from, 2);
    }

    #[tokio::test]
    async fn isolation_and_duplication() {
        let network = MemoryNetwork::new();
        let mut two = network.register(2);
        network.isolate(1);
        network.send(heartbeat(1, 2));
        assert!(two.try_recv().is_err());

        network.heal();
        network.set_duplicate_rate(1.0);
        network.send(heartbeat(1, 2));
        assert!(two.recv().await.is_some());
        assert!(two.recv().await.is_some());
    }

    #[tokio::test]
    async fn latency_delays_delivery() {
        let network = MemoryNetwork::new();
        let mut two = network.register(2);
        network.set_latency(Some(Duration::from_millis(20)..Duration::from_millis(30)));
        network.send(heartbeat(1, 2));
        assert!(two.try_recv().is_err());
        let received = tokio::time::timeout(Duration::from_secs(1), two.recv()).await;
        assert!(matches!(received, Ok(Some(_))));
    }

    #[tokio::test]
    async fn tcp_transport_carries_envelopes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_task, addr) = TcpTransport::listen("127.0.0.1:0", tx).await.unwrap();
        let transport = TcpTransport::new(HashMap::from([(2, addr.to_string())]));
        transport.send(heartbeat(1, 2));
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, heartbeat(1, 2));
    }
}
