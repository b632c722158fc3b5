//! Execution pipeline.
//!
//! The consensus core commits an ordered sequence of batches; it never
//! interprets their contents. [`Executor`] is the capability trait an
//! embedder implements to actually run them — generalizing the
//! deterministic-apply step `state.rs::StateMachineReplicator::execute`
//! performs inline into a pluggable boundary, per the capability-trait
//! re-architecture rule (virtual inheritance → trait object).
//!
//! [`ExecutionPipeline`] is the piece that keeps commit order: protocol
//! engines can hand it `(seq, batch)` pairs out of order (a `DECIDE`
//! racing a concurrent view, a retransmitted `COMMIT`), and it only ever
//! drains into the executor strictly in `seq` order, buffering the rest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::message::Batch;
use crate::Result;

/// Capability trait for the embedder's state machine.
///
/// `apply` must be deterministic: given the same `(seq, batch)` on every
/// correct replica, it must produce the same result, since its output is
/// never itself subject to consensus. An `Err` here does not roll back
/// the commit — per the error design, the batch is still considered
/// committed and `seq` still advances; the failure is reported back to
/// the proxy as part of the response instead.
pub trait Executor: Send + Sync {
    /// Apply the batch committed at `seq`, returning the opaque result
    /// forwarded to the client.
    fn apply(&self, seq: u64, batch: &Batch) -> Result<Vec<u8>>;
}

/// An `Executor` that records every `(seq, batch)` it is asked to apply
/// and echoes the batch's serialized request count back as its result.
/// Useful for tests and as a reference embedder.
#[derive(Default)]
pub struct EchoExecutor {
    applied: Mutex<Vec<(u64, Batch)>>,
}

impl EchoExecutor {
    /// Build an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(seq, batch)` applied so far, in application order.
    pub fn applied(&self) -> Vec<(u64, Batch)> {
        self.applied.lock().clone()
    }
}

impl Executor for EchoExecutor {
    fn apply(&self, seq: u64, batch: &Batch) -> Result<Vec<u8>> {
        self.applied.lock().push((seq, batch.clone()));
        Ok((batch.requests.len() as u64).to_be_bytes().to_vec())
    }
}

/// Streams committed batches to an [`Executor`] strictly in commit order.
///
/// Out-of-order arrivals are held in `pending` until the gap at
/// `next_seq` closes, then every contiguously-ready entry drains through
/// the executor in one pass.
pub struct ExecutionPipeline {
    executor: Arc<dyn Executor>,
    next_seq: AtomicU64,
    pending: Mutex<HashMap<u64, Batch>>,
}

impl ExecutionPipeline {
    /// Build a pipeline delivering to `executor`, starting at sequence 0.
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor, next_seq: AtomicU64::new(0), pending: Mutex::new(HashMap::new()) }
    }

    /// Record a newly committed `(seq, batch)`, draining every
    /// contiguously-ready entry through the executor in order. Returns
    /// the `(seq, result)` pairs applied by this call, in commit order;
    /// an executor error is carried in the result rather than aborting
    /// the drain — the commit still stands and `seq` still advances.
    pub fn on_commit(&self, seq: u64, batch: Batch) -> Vec<(u64, Result<Vec<u8>>)> {
        if seq < self.next_seq.load(Ordering::Acquire) {
            warn!(seq, "ignoring already-applied sequence, at-most-once delivery");
            return Vec::new();
        }
        self.pending.lock().insert(seq, batch);

        let mut applied = Vec::new();
        loop {
            let next = self.next_seq.load(Ordering::Acquire);
            let Some(batch) = self.pending.lock().remove(&next) else { break };
            let result = self.executor.apply(next, &batch);
            match &result {
                Ok(_) => info!(seq = next, "batch executed"),
                Err(e) => warn!(seq = next, error = %e, "executor returned an error; commit still stands"),
            }
            applied.push((next, result));
            self.next_seq.fetch_add(1, Ordering::AcqRel);
        }
        applied
    }

    /// The next sequence number the pipeline is waiting to apply.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.load(Ordering::Acquire)
    }

    /// Sequence numbers currently buffered ahead of `next_seq`, waiting
    /// for the gap to close.
    pub fn pending_seqs(&self) -> Vec<u64> {
        let mut seqs: Vec<u64> = self.pending.lock().keys().copied().collect();
        seqs.sort_unstable();
        seqs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(local_id: u64) -> Batch {
        Batch::new(local_id, 0, vec![])
    }

    #[test]
    fn in_order_commits_apply_immediately() {
        let pipeline = ExecutionPipeline::new(Arc::new(EchoExecutor::new()));
        let applied = pipeline.on_commit(0, batch(0));
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].0, 0);
        assert_eq!(pipeline.next_seq(), 1);
    }

    #[test]
    fn out_of_order_commit_buffers_until_gap_closes() {
        let pipeline = ExecutionPipeline::new(Arc::new(EchoExecutor::new()));
        let applied = pipeline.on_commit(1, batch(1));
        assert!(applied.is_empty());
        assert_eq!(pipeline.pending_seqs(), vec![1]);

        let applied = pipeline.on_commit(0, batch(0));
        assert_eq!(applied.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(pipeline.next_seq(), 2);
        assert!(pipeline.pending_seqs().is_empty());
    }

    #[test]
    fn already_applied_sequence_is_dropped_at_most_once() {
        let pipeline = ExecutionPipeline::new(Arc::new(EchoExecutor::new()));
        pipeline.on_commit(0, batch(0));
        let applied = pipeline.on_commit(0, batch(0));
        assert!(applied.is_empty());
    }

    struct FailingExecutor;
    impl Executor for FailingExecutor {
        fn apply(&self, _seq: u64, _batch: &Batch) -> Result<Vec<u8>> {
            Err(crate::ConsensusError::ExecutorError("boom".to_string()))
        }
    }

    #[test]
    fn executor_error_does_not_block_sequence_advance() {
        let pipeline = ExecutionPipeline::new(Arc::new(FailingExecutor));
        let applied = pipeline.on_commit(0, batch(0));
        assert!(applied[0].1.is_err());
        assert_eq!(pipeline.next_seq(), 1);
    }
}
