//! Message Transport Adapter.
//!
//! `send_to` / `broadcast` / `inbound` over a point-to-point channel set.
//! Delivery is best-effort and unordered; duplicates may occur. The
//! protocol engines tolerate reordering and duplication through hash/seq
//! checks, never relying on the adapter for FIFO delivery between a pair.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::identity::ReplicaId;
use crate::{ConsensusError, Result};

/// An opaque, already-framed wire message plus routing metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerMessage {
    /// Originating replica.
    pub source: ReplicaId,
    /// Destination replica (ignored for broadcasts).
    pub destination: ReplicaId,
    /// Monotonic per-sender sequence number, for Byzantine-sender and
    /// ordering-fault detection — not a substitute for protocol-level
    /// sequencing.
    pub sequence: u64,
    /// Send-time timestamp, milliseconds since epoch.
    pub timestamp_ms: u64,
    /// `bincode`-encoded protocol payload.
    pub payload: Vec<u8>,
}

impl PeerMessage {
    /// Whether this message is addressed to every replica.
    pub fn is_broadcast(&self) -> bool {
        self.destination == 0
    }
}

/// Opaque per-message delivery context (proxy/client identity, etc.),
/// threaded alongside a decoded `Request` by `inbound()`.
#[derive(Clone, Debug, Default)]
pub struct Context {
    /// The replica that delivered this message to us, if known.
    pub from: Option<ReplicaId>,
}

/// Message Transport Adapter capability.
///
/// Generalizes the source system's `ReplicaCommunicator` into a trait per
/// the Design Notes' capability-trait re-architecture rule: protocol
/// engines and the replica runtime hold this by `Arc<dyn
/// ReplicaCommunicator>`, never depending on a concrete transport.
#[async_trait]
pub trait ReplicaCommunicator: Send + Sync {
    /// Send a message to a single peer. Best-effort; duplicates may occur.
    async fn send_to(&self, node_id: ReplicaId, payload: Vec<u8>) -> Result<()>;

    /// Send a message to every other replica. Best-effort; duplicates may
    /// occur and delivery is not guaranteed FIFO between any pair.
    async fn broadcast(&self, payload: Vec<u8>) -> Result<()>;

    /// Receive the next inbound message, or `None` once `shutdown()` has
    /// closed the inbound stream.
    async fn inbound(&self) -> Option<(Context, PeerMessage)>;

    /// Close the inbound stream; all waiters observe `STOPPED` (a `None`
    /// from `inbound()`).
    fn shutdown(&self);
}

/// In-process, channel-based [`ReplicaCommunicator`] used for tests and
/// single-process deployments. Grounded on the ambient crate's
/// `NetworkNode`/`PeerDiscovery` bookkeeping, generalized behind the trait
/// above and backed by `tokio::sync::mpsc` instead of a real socket.
pub struct InProcessCommunicator {
    self_id: ReplicaId,
    peers: Arc<DashMap<ReplicaId, mpsc::UnboundedSender<(Context, PeerMessage)>>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<(Context, PeerMessage)>>,
    seq: AtomicU64,
    byzantine: Mutex<HashSet<ReplicaId>>,
    last_seen_seq: DashMap<ReplicaId, u64>,
    stopped: std::sync::atomic::AtomicBool,
}

impl InProcessCommunicator {
    /// Create a communicator for `self_id`; `register` must be called for
    /// every peer (including self-loops, if desired) before messages can
    /// be delivered to them.
    pub fn new(self_id: ReplicaId) -> (Arc<Self>, mpsc::UnboundedSender<(Context, PeerMessage)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let comm = Arc::new(Self {
            self_id,
            peers: Arc::new(DashMap::new()),
            inbound_rx: Mutex::new(rx),
            seq: AtomicU64::new(0),
            byzantine: Mutex::new(HashSet::new()),
            last_seen_seq: DashMap::new(),
            stopped: std::sync::atomic::AtomicBool::new(false),
        });
        (comm, tx)
    }

    /// Register a peer's inbound sender so `send_to`/`broadcast` can
    /// reach it.
    pub fn register_peer(&self, id: ReplicaId, sender: mpsc::UnboundedSender<(Context, PeerMessage)>) {
        self.peers.insert(id, sender);
    }

    /// Replicas flagged as Byzantine by sequence-number regression
    /// detection (a message with a sequence number not greater than a
    /// previously observed one from the same sender).
    pub fn byzantine_senders(&self) -> Vec<ReplicaId> {
        self.byzantine.lock().iter().copied().collect()
    }

    fn detect_byzantine_sender(&self, msg: &PeerMessage) {
        if let Some(mut prev) = self.last_seen_seq.get_mut(&msg.source) {
            if msg.sequence != 0 && msg.sequence <= *prev {
                self.byzantine.lock().insert(msg.source);
            }
            if msg.sequence > *prev {
                *prev = msg.sequence;
            }
        } else {
            self.last_seen_seq.insert(msg.source, msg.sequence);
        }
    }
}

#[async_trait]
impl ReplicaCommunicator for InProcessCommunicator {
    async fn send_to(&self, node_id: ReplicaId, payload: Vec<u8>) -> Result<()> {
        let Some(sender) = self.peers.get(&node_id) else {
            return Err(ConsensusError::TransportError(format!(
                "no route to replica {node_id}"
            )));
        };
        let msg = PeerMessage {
            source: self.self_id,
            destination: node_id,
            sequence: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp_ms: 0,
            payload,
        };
        sender
            .send((Context { from: Some(self.self_id) }, msg))
            .map_err(|e| ConsensusError::TransportError(e.to_string()))
    }

    async fn broadcast(&self, payload: Vec<u8>) -> Result<()> {
        let mut last_err = None;
        for entry in self.peers.iter() {
            let peer_id = *entry.key();
            if peer_id == self.self_id {
                continue;
            }
            if let Err(e) = self.send_to(peer_id, payload.clone()).await {
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn inbound(&self) -> Option<(Context, PeerMessage)> {
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }
        let mut rx = self.inbound_rx.lock();
        let msg = rx.recv().await;
        if let Some((_, ref m)) = msg {
            self.detect_byzantine_sender(m);
        }
        msg
    }

    fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(a: &Arc<InProcessCommunicator>, a_tx: &mpsc::UnboundedSender<(Context, PeerMessage)>, b: &Arc<InProcessCommunicator>, b_tx: &mpsc::UnboundedSender<(Context, PeerMessage)>) {
        a.register_peer(b.self_id, b_tx.clone());
        b.register_peer(a.self_id, a_tx.clone());
    }

    #[tokio::test]
    async fn send_to_delivers_to_the_named_peer() {
        let (a, a_tx) = InProcessCommunicator::new(1);
        let (b, b_tx) = InProcessCommunicator::new(2);
        link(&a, &a_tx, &b, &b_tx);

        a.send_to(2, b"hello".to_vec()).await.unwrap();
        let (_, msg) = b.inbound().await.unwrap();
        assert_eq!(msg.payload, b"hello");
        assert_eq!(msg.source, 1);
    }

    #[tokio::test]
    async fn shutdown_makes_inbound_return_none() {
        let (a, _a_tx) = InProcessCommunicator::new(1);
        a.shutdown();
        assert!(a.inbound().await.is_none());
    }

    #[tokio::test]
    async fn sequence_regression_flags_a_byzantine_sender() {
        let (a, a_tx) = InProcessCommunicator::new(1);
        let (b, b_tx) = InProcessCommunicator::new(2);
        link(&a, &a_tx, &b, &b_tx);

        a.send_to(2, b"1".to_vec()).await.unwrap();
        b.inbound().await.unwrap();
        a.send_to(2, b"2".to_vec()).await.unwrap();
        b.inbound().await.unwrap();

        // Forge a stale/duplicate sequence directly from node 1's sender.
        b_tx.send((Context::default(), PeerMessage {
            source: 1,
            destination: 2,
            sequence: 1,
            timestamp_ms: 0,
            payload: vec![],
        })).unwrap();
        b.inbound().await.unwrap();
        assert!(b.byzantine_senders().contains(&1));
    }
}
