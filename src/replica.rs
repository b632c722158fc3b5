//! Replica Runtime.
//!
//! Owns one replica's identity, lifecycle, and cooperative task set, and
//! routes inbound wire messages to whichever ordering-core engine
//! (`hotstuff`, `tusk`, or `raft`) the configuration selected. Generalizes
//! the source system's per-protocol `ReplicaServer`/`CheckPointManager`
//! driving loop into a single runtime parametric over [`ConsensusAlgorithm`],
//! per the capability-trait re-architecture rule: every collaborator
//! (crypto, transport, executor) is held by `Arc<dyn Trait>`.
//!
//! A client-visible response is sent back to the batch's `proxy_id` the
//! moment the batch commits; the batching manager on that proxy seals the
//! client's future at `min_client_receive_num` matching responses, giving
//! the usual at-most-once delivery contract even though every replica that
//! committed the batch sends one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batching::BatchingManager;
use crate::byzantine::ByzantineFaultDetector;
use crate::config::ReplicaConfig;
use crate::crypto::SignatureVerifier;
use crate::execution::{Executor, ExecutionPipeline};
use crate::hotstuff::{ChainedPrepare, HotStuffEngine, HotStuffMessage, ProposalNode, QuorumCertificate, Vote as HotStuffVote};
use crate::identity::{ReplicaId, ReplicaTable};
use crate::message::{Batch, Certificate};
use crate::raft::{AppendEntriesArgs, AppendEntriesReply, RaftEngine, RaftRole, RequestVoteArgs, RequestVoteReply};
use crate::stats::Stats;
use crate::transport::ReplicaCommunicator;
use crate::tusk::{Ack, ProposalBlock, TuskEngine};
use crate::validator::ValidatorSet;
use crate::{ConsensusAlgorithm, ConsensusError, Result};

/// Tusk's three network-visible message kinds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TuskWireMessage {
    /// A proposer's new block for the current round.
    Propose(ProposalBlock),
    /// A single replica's acknowledgement of a proposed block.
    Ack(Ack),
    /// The proposer's broadcast of a block once its certificate reaches
    /// quorum, so replicas that did not see every individual `Ack` still
    /// adopt a usable strong-parent candidate.
    Cert { block: ProposalBlock, certificate: Certificate },
}

/// Raft's four RPC message kinds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RaftWireMessage {
    /// `RequestVote` RPC.
    RequestVote(RequestVoteArgs),
    /// `RequestVote` reply.
    RequestVoteReply(RequestVoteReply),
    /// `AppendEntries` RPC (also the heartbeat).
    AppendEntries(AppendEntriesArgs),
    /// `AppendEntries` reply.
    AppendEntriesReply(AppendEntriesReply),
}

/// Every message type the replica runtime dispatches, carried as the
/// `payload` of a [`crate::transport::PeerMessage`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ReplicaMessage {
    /// A client batch forwarded from a non-primary/non-leader proxy to the
    /// replica currently driving the ordering core.
    ClientBatch(Batch),
    /// A client-visible response routed back to the proxy that forwarded
    /// the originating batch.
    BatchResponse {
        /// The batch's `local_id` on the proxy that assembled it.
        local_id: u64,
        /// The replica sending this response.
        sender_id: ReplicaId,
        /// The executor's opaque result (or `b"ERROR"` on failure).
        payload: Vec<u8>,
    },
    /// chained-HotStuff pipeline message.
    HotStuff(HotStuffMessage),
    /// Tusk DAG message.
    Tusk(TuskWireMessage),
    /// Raft RPC message.
    Raft(RaftWireMessage),
}

/// The active ordering-core engine for one replica, selected at startup by
/// [`ReplicaConfig::algorithm`] and never swapped at runtime (per the
/// Non-goal: no dynamic protocol switching).
enum Engine {
    HotStuff(Arc<HotStuffEngine>),
    Tusk(Arc<TuskEngine>),
    Raft(Arc<RaftEngine>),
}

/// Replica Runtime: the process-level object a host binary constructs,
/// starts, and shuts down.
///
/// Grounded on the source system's `ReplicaServer` driving loop, split
/// here into cooperative `tokio` tasks per the message-passing
/// re-architecture rule (no condition-variable worker threads): one task
/// dispatches inbound wire messages, one assembles and proposes client
/// batches, and (protocol-dependent) one or two timer tasks drive
/// liveness — Raft's election timeout and heartbeat, or HotStuff's
/// view-change backstop.
pub struct Replica {
    self_id: ReplicaId,
    table: ReplicaTable,
    config: ReplicaConfig,
    verifier: Arc<dyn SignatureVerifier>,
    comm: Arc<dyn ReplicaCommunicator>,
    engine: Engine,
    batching: Arc<BatchingManager>,
    pipeline: Arc<ExecutionPipeline>,
    stats: Arc<Stats>,
    validators: ValidatorSet,
    faults: Mutex<ByzantineFaultDetector>,
    /// `seq -> Batch` for committed-but-not-yet-acknowledged batches, so a
    /// pipeline drain (which returns only `(seq, result)`) can still be
    /// traced back to the requests' `proxy_id`s.
    batch_log: DashMap<u64, Batch>,
    /// Tusk: own blocks awaiting certification, so a later `on_ack` quorum
    /// can be paired with the block for the `Cert` broadcast.
    tusk_own_blocks: DashMap<crate::crypto::Digest, ProposalBlock>,
    tusk_last_proposed_round: AtomicU64,
    /// HotStuff: `high_qc` reported by `NEW_VIEW` senders, aggregated by
    /// the primary of the *next* view, keyed by that view.
    hotstuff_ready_justify: Mutex<HashMap<u64, QuorumCertificate>>,
    hotstuff_last_progress: Mutex<Instant>,
    last_heartbeat: Mutex<Instant>,
    stop: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Replica {
    /// Build a replica runtime. Does not start any background task —
    /// call [`Self::start`] once constructed.
    pub fn new(
        config: ReplicaConfig,
        verifier: Arc<dyn SignatureVerifier>,
        comm: Arc<dyn ReplicaCommunicator>,
        executor: Arc<dyn Executor>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let table = config.replica_table()?;
        let self_id = table.self_id();
        let n = table.len();
        let algorithm = config.algorithm()?;

        let engine = match algorithm {
            ConsensusAlgorithm::HotStuff => Engine::HotStuff(Arc::new(HotStuffEngine::new(self_id, n))),
            ConsensusAlgorithm::Tusk => Engine::Tusk(Arc::new(TuskEngine::new(self_id, n))),
            ConsensusAlgorithm::Raft => Engine::Raft(Arc::new(RaftEngine::new(self_id, n))),
        };

        let batching = Arc::new(BatchingManager::new(
            config.client_batch_num as usize,
            config.client_batch_wait_ms,
            config.resolved_min_client_receive_num(),
            config.max_process_txn,
        ));
        let pipeline = Arc::new(ExecutionPipeline::new(executor));
        let stats = Arc::new(Stats::new()?);
        let validators = ValidatorSet::from_replica_table(&table);
        let faults = Mutex::new(ByzantineFaultDetector::new(n));

        let mut hotstuff_ready_justify = HashMap::new();
        if let Engine::HotStuff(_) = &engine {
            if table.bft_primary(1) == self_id {
                hotstuff_ready_justify.insert(1, HotStuffEngine::genesis_justify());
            }
        }

        Ok(Arc::new(Self {
            self_id,
            table,
            config,
            verifier,
            comm,
            engine,
            batching,
            pipeline,
            stats,
            validators,
            faults,
            batch_log: DashMap::new(),
            tusk_own_blocks: DashMap::new(),
            tusk_last_proposed_round: AtomicU64::new(0),
            hotstuff_ready_justify: Mutex::new(hotstuff_ready_justify),
            hotstuff_last_progress: Mutex::new(Instant::now()),
            last_heartbeat: Mutex::new(Instant::now()),
            stop: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// This replica's own id.
    pub fn self_id(&self) -> ReplicaId {
        self.self_id
    }

    /// Metrics handle, for an embedder hosting a `/metrics` endpoint.
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Reputation/Byzantine-flag table, for an embedder's admin surface.
    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// Next sequence number the execution pipeline is waiting on — a
    /// monotonically increasing proxy for committed height.
    pub fn committed_seq(&self) -> u64 {
        self.pipeline.next_seq()
    }

    /// Submit a client request; the returned receiver resolves once the
    /// batch carrying it has been committed and acknowledged by quorum, or
    /// to `b"ERROR"` if it never does within `client_timeout_ms`.
    pub async fn submit(&self, sender_id: ReplicaId, payload: Vec<u8>) -> Result<tokio::sync::oneshot::Receiver<Vec<u8>>> {
        self.batching.submit(sender_id, payload).await
    }

    /// Start the cooperative task set. Safe to call at most once.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        tasks.push(self.clone().spawn_inbound_dispatch());
        tasks.push(self.clone().spawn_batch_proposer());
        match &self.engine {
            Engine::Raft(_) => {
                tasks.push(self.clone().spawn_raft_election_timer());
                tasks.push(self.clone().spawn_raft_heartbeat());
            }
            Engine::HotStuff(_) => {
                tasks.push(self.clone().spawn_hotstuff_view_timer());
            }
            Engine::Tusk(_) => {
                tasks.push(self.clone().spawn_tusk_round_driver());
            }
        }
        info!(self_id = self.self_id, "replica runtime started");
    }

    /// Stop every background task and close the transport's inbound
    /// stream. Idempotent.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.comm.shutdown();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        info!(self_id = self.self_id, "replica runtime stopped");
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    async fn send(&self, to: ReplicaId, msg: ReplicaMessage) -> Result<()> {
        let payload = bincode::serialize(&msg)?;
        self.comm.send_to(to, payload).await
    }

    async fn broadcast(&self, msg: ReplicaMessage) -> Result<()> {
        let payload = bincode::serialize(&msg)?;
        self.comm.broadcast(payload).await
    }

    // ---- inbound dispatch -------------------------------------------------

    fn spawn_inbound_dispatch(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.is_stopped() {
                    break;
                }
                let Some((_ctx, peer_msg)) = self.comm.inbound().await else { break };
                let decoded: ReplicaMessage = match bincode::deserialize(&peer_msg.payload) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, source = peer_msg.source, "dropping malformed inbound message");
                        self.stats.record_dropped_message();
                        continue;
                    }
                };
                if let Err(e) = self.dispatch(peer_msg.source, decoded).await {
                    debug!(error = %e, source = peer_msg.source, "inbound message dropped");
                    self.stats.record_dropped_message();
                }
            }
        })
    }

    async fn dispatch(&self, source: ReplicaId, msg: ReplicaMessage) -> Result<()> {
        match msg {
            ReplicaMessage::ClientBatch(batch) => self.propose_or_forward(batch).await,
            ReplicaMessage::BatchResponse { local_id, sender_id, payload } => {
                self.batching.response_tracker.on_response(local_id, sender_id, payload);
                Ok(())
            }
            ReplicaMessage::HotStuff(m) => self.handle_hotstuff(source, m).await,
            ReplicaMessage::Tusk(m) => self.handle_tusk(source, m).await,
            ReplicaMessage::Raft(m) => self.handle_raft(source, m).await,
        }
    }

    fn mark_auth_fault(&self, sender: ReplicaId, context: &str) {
        self.faults.lock().detect_authentication_fault(sender, context).ok();
        if self.validators.mark_byzantine(sender).is_ok() {
            self.stats.record_byzantine_detection();
        }
    }

    // ---- client batching ---------------------------------------------------

    fn spawn_batch_proposer(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.is_stopped() {
                    break;
                }
                let Some((mut batch, waiters)) = self.batching.next_batch().await else { break };
                for req in batch.requests.iter_mut() {
                    req.proxy_id = self.self_id;
                }
                self.spawn_response_timeout(batch.local_id);
                self.batching.register_waiters(batch.local_id, waiters);
                if let Err(e) = self.propose_or_forward(batch).await {
                    warn!(error = %e, "failed to propose or forward client batch");
                }
            }
        })
    }

    /// Force-seal a batch's response with `ERROR` if it is still pending
    /// once `client_timeout_ms` elapses, bounding per-request latency.
    fn spawn_response_timeout(self: &Arc<Self>, local_id: u64) {
        let replica = self.clone();
        let timeout = Duration::from_millis(replica.config.client_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            replica.batching.response_tracker.timeout(local_id);
        });
    }

    async fn propose_or_forward(&self, batch: Batch) -> Result<()> {
        match &self.engine {
            Engine::HotStuff(engine) => {
                let primary = self.table.bft_primary(engine.current_view());
                if primary == self.self_id {
                    self.hotstuff_try_propose(engine, Some(batch)).await
                } else {
                    self.send(primary, ReplicaMessage::ClientBatch(batch)).await
                }
            }
            Engine::Tusk(engine) => self.tusk_propose(engine, batch).await,
            Engine::Raft(engine) => {
                if engine.role() == RaftRole::Leader {
                    self.raft_append(engine, batch).await
                } else if let Some(leader) = engine.leader_id() {
                    self.send(leader, ReplicaMessage::ClientBatch(batch)).await
                } else {
                    Err(ConsensusError::QuorumTimeout("no known raft leader yet".to_string()))
                }
            }
        }
    }

    /// Notify the proxy of every request in a just-committed `batch`,
    /// assigning it `seq` and recording commit latency. Inserts `batch`
    /// into `batch_log` under `seq` first, so the pipeline's drain (which
    /// only returns `(seq, result)` pairs) can always recover the original
    /// batch for response routing — including out-of-order entries that
    /// were buffered by an earlier call and only drain on this one.
    async fn publish_committed(&self, seq: u64, batch: &Batch, started: Instant) {
        self.stats.record_commit(started.elapsed().as_secs_f64() * 1000.0);
        self.batch_log.insert(seq, batch.clone());
        let result = self.pipeline.on_commit(seq, batch.clone());
        for (applied_seq, outcome) in result {
            let Some((_, applied_batch)) = self.batch_log.remove(&applied_seq) else { continue };
            let payload = outcome.unwrap_or_else(|_| b"ERROR".to_vec());
            for req in &applied_batch.requests {
                if req.proxy_id == self.self_id {
                    self.batching.response_tracker.on_response(
                        applied_batch.local_id,
                        self.self_id,
                        payload.clone(),
                    );
                } else {
                    let msg = ReplicaMessage::BatchResponse {
                        local_id: applied_batch.local_id,
                        sender_id: self.self_id,
                        payload: payload.clone(),
                    };
                    if let Err(e) = self.send(req.proxy_id, msg).await {
                        debug!(error = %e, proxy = req.proxy_id, "failed to deliver batch response");
                    }
                }
                break; // one response per batch, all requests share local_id/proxy_id
            }
        }
    }

    // ---- chained-HotStuff ---------------------------------------------------

    async fn hotstuff_try_propose(&self, engine: &Arc<HotStuffEngine>, batch: Option<Batch>) -> Result<()> {
        let view = engine.current_view();
        let Some(justify) = self.hotstuff_ready_justify.lock().remove(&view) else {
            return Err(ConsensusError::QuorumTimeout(format!(
                "primary for view {view} has not yet collected 2f+1 NEW_VIEW"
            )));
        };
        let payload = batch.unwrap_or_else(|| Batch::new(0, 0, vec![]));
        let node = engine.make_prepare(view, justify.node_hash, payload, justify.clone());
        self.broadcast(ReplicaMessage::HotStuff(HotStuffMessage::Prepare { node, justify })).await
    }

    async fn handle_hotstuff(&self, source: ReplicaId, msg: HotStuffMessage) -> Result<()> {
        let Engine::HotStuff(engine) = &self.engine else {
            return Err(ConsensusError::ProtocolViolation("received HotStuff message on a non-HotStuff replica".to_string()));
        };
        match msg {
            HotStuffMessage::NewView { view, high_qc } => {
                if let Some(best) = engine.on_new_view(view, source, high_qc) {
                    let justify = best.unwrap_or_else(HotStuffEngine::genesis_justify);
                    self.hotstuff_ready_justify.lock().insert(view, justify);
                    // A fresh view is ready; propose immediately if a batch
                    // is already queued, otherwise the next `next_batch()`
                    // wakeup will find `hotstuff_ready_justify` populated.
                    let _ = self.hotstuff_try_propose(engine, None).await;
                }
                Ok(())
            }
            HotStuffMessage::Prepare { node, justify } => {
                let vote = match engine.on_prepare(node, justify, self.verifier.as_ref()) {
                    Ok(v) => v,
                    Err(e) => {
                        self.mark_auth_fault(source, "hotstuff prepare rejected");
                        return Err(e);
                    }
                };
                *self.hotstuff_last_progress.lock() = Instant::now();
                let primary = self.table.bft_primary(vote.view);
                self.send(primary, ReplicaMessage::HotStuff(HotStuffMessage::PrepareVote(vote))).await
            }
            HotStuffMessage::PrepareVote(vote) => {
                if let Some(qc) = engine.on_vote(vote) {
                    let chained_prepare = self.hotstuff_build_chained_prepare(engine, qc.view + 1);
                    self.broadcast(ReplicaMessage::HotStuff(HotStuffMessage::PreCommit { qc, chained_prepare })).await
                } else {
                    Ok(())
                }
            }
            HotStuffMessage::PreCommit { qc, chained_prepare } => {
                let (vote, chained_vote) =
                    engine.on_precommit(qc, chained_prepare.as_ref(), self.verifier.as_ref())?;
                *self.hotstuff_last_progress.lock() = Instant::now();
                let primary = self.table.bft_primary(vote.view);
                self.send(primary, ReplicaMessage::HotStuff(HotStuffMessage::PreCommitVote(vote))).await?;
                if let Some(cv) = chained_vote {
                    let next_primary = self.table.bft_primary(cv.view);
                    self.send(next_primary, ReplicaMessage::HotStuff(HotStuffMessage::PrepareVote(cv))).await?;
                }
                Ok(())
            }
            HotStuffMessage::PreCommitVote(vote) => {
                if let Some(qc) = engine.on_vote(vote) {
                    self.broadcast(ReplicaMessage::HotStuff(HotStuffMessage::Commit { qc })).await
                } else {
                    Ok(())
                }
            }
            HotStuffMessage::Commit { qc } => {
                let vote = engine.on_commit(qc, self.verifier.as_ref())?;
                *self.hotstuff_last_progress.lock() = Instant::now();
                let primary = self.table.bft_primary(vote.view);
                self.send(primary, ReplicaMessage::HotStuff(HotStuffMessage::CommitVote(vote))).await
            }
            HotStuffMessage::CommitVote(vote) => {
                if let Some(qc) = engine.on_vote(vote) {
                    self.broadcast(ReplicaMessage::HotStuff(HotStuffMessage::Decide { qc })).await
                } else {
                    Ok(())
                }
            }
            HotStuffMessage::Decide { qc } => {
                let started = Instant::now();
                let decided_view = qc.view;
                let node = engine.on_decide(qc, self.verifier.as_ref())?;
                *self.hotstuff_last_progress.lock() = Instant::now();
                // `node.view` is not gapless (a view can fail without
                // deciding), so the pipeline's own counter is the seq.
                let seq = self.pipeline.next_seq();
                self.publish_committed(seq, &node.payload, started).await;
                let next_primary = self.table.bft_primary(decided_view + 1);
                let new_view = ReplicaMessage::HotStuff(HotStuffMessage::NewView {
                    view: decided_view + 1,
                    high_qc: engine.high_qc(),
                });
                self.send(next_primary, new_view).await
            }
            HotStuffMessage::PrepareVote(_)
            | HotStuffMessage::PreCommitVote(_)
            | HotStuffMessage::CommitVote(_) => unreachable!("handled above"),
        }
    }

    /// Primary-side: if a client batch is already queued and the next
    /// view's prepare can be built, piggyback it per the chained-HotStuff
    /// pipeline shape. Returns `None` when there is nothing ready to
    /// piggyback, which is always a safe (merely less pipelined) choice.
    fn hotstuff_build_chained_prepare(&self, _engine: &Arc<HotStuffEngine>, _next_view: u64) -> Option<ChainedPrepare> {
        None
    }

    fn spawn_hotstuff_view_timer(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.is_stopped() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(self.config.timeout_max_ms)).await;
                let Engine::HotStuff(engine) = &self.engine else { return };
                let stalled = self.hotstuff_last_progress.lock().elapsed() >= Duration::from_millis(self.config.timeout_max_ms);
                if stalled {
                    self.stats.record_view_change();
                    let view = engine.current_view() + 1;
                    let next_primary = self.table.bft_primary(view);
                    let msg = ReplicaMessage::HotStuff(HotStuffMessage::NewView { view, high_qc: engine.high_qc() });
                    if let Err(e) = self.send(next_primary, msg).await {
                        debug!(error = %e, "failed to send liveness NEW_VIEW");
                    }
                }
            }
        })
    }

    // ---- Tusk ---------------------------------------------------------------

    async fn tusk_propose(&self, engine: &Arc<TuskEngine>, batch: Batch) -> Result<()> {
        let round = engine.current_round();
        if self.tusk_last_proposed_round.load(Ordering::Acquire) >= round {
            // already have an outstanding proposal for this round; the
            // caller's batch will be picked up once the round advances.
            return Err(ConsensusError::QuorumTimeout(format!("already proposed for round {round}")));
        }
        let block = engine.propose(batch)?;
        self.tusk_last_proposed_round.store(round, Ordering::Release);
        self.tusk_own_blocks.insert(block.hash, block.clone());
        self.broadcast(ReplicaMessage::Tusk(TuskWireMessage::Propose(block))).await
    }

    async fn handle_tusk(&self, source: ReplicaId, msg: TuskWireMessage) -> Result<()> {
        let Engine::Tusk(engine) = &self.engine else {
            return Err(ConsensusError::ProtocolViolation("received Tusk message on a non-Tusk replica".to_string()));
        };
        match msg {
            TuskWireMessage::Propose(block) => {
                let ack = match engine.on_receive_block(block, self.verifier.as_ref()) {
                    Ok(a) => a,
                    Err(e) => {
                        self.mark_auth_fault(source, "tusk block rejected");
                        return Err(e);
                    }
                };
                self.send(source, ReplicaMessage::Tusk(TuskWireMessage::Ack(ack))).await
            }
            TuskWireMessage::Ack(ack) => {
                if let Some(cert) = engine.on_ack(ack.clone()) {
                    if let Some((_, block)) = self.tusk_own_blocks.remove(&ack.block_hash) {
                        self.broadcast(ReplicaMessage::Tusk(TuskWireMessage::Cert { block, certificate: cert })).await?;
                    }
                }
                self.tusk_try_commit(engine).await
            }
            TuskWireMessage::Cert { block, certificate } => {
                if let Err(e) = engine.adopt_cert(block, certificate, self.verifier.as_ref()) {
                    self.mark_auth_fault(source, "tusk certificate rejected");
                    return Err(e);
                }
                self.tusk_try_commit(engine).await
            }
        }
    }

    /// Scan every even round up to the current one for a freshly
    /// committable anchor, publishing each committed block's batch to the
    /// proxy in round-then-proposer order.
    async fn tusk_try_commit(&self, engine: &Arc<TuskEngine>) -> Result<()> {
        let started = Instant::now();
        let current = engine.current_round();
        let mut round = 0;
        while round < current {
            if let Some(sequence) = engine.try_commit(round) {
                for block in sequence {
                    let seq = self.pipeline.next_seq();
                    self.publish_committed(seq, &block.payload, started).await;
                }
            }
            round += 2;
        }
        Ok(())
    }

    fn spawn_tusk_round_driver(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.is_stopped() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                let Engine::Tusk(engine) = &self.engine else { return };
                let round = engine.current_round();
                if self.tusk_last_proposed_round.load(Ordering::Acquire) >= round {
                    continue;
                }
                // Keep the DAG advancing even without client traffic: an
                // empty batch still carries the round forward.
                if let Err(e) = self.tusk_propose(engine, Batch::new(0, 0, vec![])).await {
                    debug!(error = %e, round, "tusk round driver could not propose yet");
                }
            }
        })
    }

    // ---- Raft ---------------------------------------------------------------

    async fn raft_append(&self, engine: &Arc<RaftEngine>, batch: Batch) -> Result<()> {
        let started = Instant::now();
        let payload = bincode::serialize(&batch)?;
        let index = engine.append_entry(payload)?;
        self.batch_log.insert(index, batch);
        for peer in self.table.ids() {
            if peer == self.self_id {
                continue;
            }
            let args = engine.make_append_entries(peer);
            self.send(peer, ReplicaMessage::Raft(RaftWireMessage::AppendEntries(args))).await?;
        }
        self.raft_drain_commits(engine, started).await;
        Ok(())
    }

    async fn handle_raft(&self, source: ReplicaId, msg: RaftWireMessage) -> Result<()> {
        let Engine::Raft(engine) = &self.engine else {
            return Err(ConsensusError::ProtocolViolation("received Raft message on a non-Raft replica".to_string()));
        };
        match msg {
            RaftWireMessage::RequestVote(args) => {
                let reply = engine.handle_request_vote(&args);
                self.send(source, ReplicaMessage::Raft(RaftWireMessage::RequestVoteReply(reply))).await
            }
            RaftWireMessage::RequestVoteReply(reply) => {
                let became_leader = engine.on_vote_reply(reply);
                if became_leader {
                    self.stats.record_view_change();
                    for peer in self.table.ids() {
                        if peer == self.self_id {
                            continue;
                        }
                        let args = engine.make_append_entries(peer);
                        self.send(peer, ReplicaMessage::Raft(RaftWireMessage::AppendEntries(args))).await?;
                    }
                }
                Ok(())
            }
            RaftWireMessage::AppendEntries(args) => {
                *self.last_heartbeat.lock() = Instant::now();
                let reply = engine.handle_append_entries(&args);
                self.send(source, ReplicaMessage::Raft(RaftWireMessage::AppendEntriesReply(reply))).await?;
                self.raft_drain_commits(engine, Instant::now()).await;
                Ok(())
            }
            RaftWireMessage::AppendEntriesReply(reply) => {
                let retry_needed = !reply.success;
                engine.on_append_entries_reply(source, &reply);
                self.raft_drain_commits(engine, Instant::now()).await;
                if retry_needed && engine.role() == RaftRole::Leader {
                    let args = engine.make_append_entries(source);
                    self.send(source, ReplicaMessage::Raft(RaftWireMessage::AppendEntries(args))).await?;
                }
                Ok(())
            }
        }
    }

    async fn raft_drain_commits(&self, engine: &Arc<RaftEngine>, started: Instant) {
        for entry in engine.take_newly_committed() {
            let batch: Batch = match self.batch_log.remove(&entry.index).map(|(_, b)| b) {
                Some(b) => b,
                None => match bincode::deserialize(&entry.payload) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, index = entry.index, "committed raft entry is not a decodable batch");
                        continue;
                    }
                },
            };
            // Raft log indices are 1-based; the execution pipeline's `seq`
            // counter is 0-based and starts at 0.
            self.publish_committed(entry.index - 1, &batch, started).await;
        }
    }

    fn spawn_raft_election_timer(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.is_stopped() {
                    break;
                }
                let timeout_ms = {
                    let mut rng = rand::thread_rng();
                    rng.gen_range(self.config.timeout_min_ms..=self.config.timeout_max_ms)
                };
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                let Engine::Raft(engine) = &self.engine else { return };
                if engine.role() == RaftRole::Leader {
                    continue;
                }
                if self.last_heartbeat.lock().elapsed() < Duration::from_millis(timeout_ms) {
                    continue;
                }
                self.stats.record_view_change();
                let args = engine.start_election();
                if let Err(e) = self.broadcast(ReplicaMessage::Raft(RaftWireMessage::RequestVote(args))).await {
                    debug!(error = %e, "failed to broadcast RequestVote");
                }
            }
        })
    }

    fn spawn_raft_heartbeat(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.is_stopped() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(self.config.heartbeat_ms)).await;
                let Engine::Raft(engine) = &self.engine else { return };
                if engine.role() != RaftRole::Leader {
                    continue;
                }
                for peer in self.table.ids() {
                    if peer == self.self_id {
                        continue;
                    }
                    let args = engine.make_append_entries(peer);
                    if let Err(e) = self.send(peer, ReplicaMessage::Raft(RaftWireMessage::AppendEntries(args))).await {
                        debug!(error = %e, peer, "heartbeat send failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519Verifier;
    use crate::execution::EchoExecutor;
    use crate::transport::InProcessCommunicator;
    use std::collections::BTreeMap;

    fn config_for(self_id: ReplicaId, n: u32, consensus: &str) -> ReplicaConfig {
        let text = format!(
            r#"
self_id = {self_id}
consensus = "{consensus}"
client_batch_num = 1
client_batch_wait_ms = 5
client_timeout_ms = 2000
timeout_min_ms = 50
timeout_max_ms = 100
heartbeat_ms = 10

{}
"#,
            (1..=n)
                .map(|i| format!(
                    "[[replicas]]\nid = {i}\nhost = \"127.0.0.1\"\nport = {}\npublic_key = \"pk{i}\"\n",
                    9000 + i
                ))
                .collect::<Vec<_>>()
                .join("\n")
        );
        ReplicaConfig::from_toml(&text).unwrap()
    }

    fn verifiers(n: u32) -> Vec<Ed25519Verifier> {
        let keys: Vec<_> = (1..=n)
            .map(|i| (i, ed25519_dalek::SigningKey::from_bytes(&[i as u8; 32])))
            .collect();
        let mut out = Vec::new();
        for (id, signing_key) in &keys {
            let mut peer_keys = BTreeMap::new();
            for (peer_id, peer_key) in &keys {
                peer_keys.insert(*peer_id, peer_key.verifying_key());
            }
            out.push(Ed25519Verifier::new(*id, signing_key.clone(), peer_keys));
        }
        out
    }

    #[tokio::test]
    async fn raft_replica_elects_itself_leader_and_commits_a_submitted_request() {
        let n = 3u32;
        let vs = verifiers(n);
        let mut comms = Vec::new();
        let mut senders = Vec::new();
        for i in 1..=n {
            let (comm, tx) = InProcessCommunicator::new(i);
            comms.push(comm);
            senders.push(tx);
        }
        for i in 0..n as usize {
            for j in 0..n as usize {
                if i == j {
                    continue;
                }
                comms[i].register_peer((j + 1) as ReplicaId, senders[j].clone());
            }
        }

        let mut replicas = Vec::new();
        for (i, v) in vs.into_iter().enumerate() {
            let config = config_for((i + 1) as ReplicaId, n, "raft");
            let replica =
                Replica::new(config, Arc::new(v), comms[i].clone(), Arc::new(EchoExecutor::new())).unwrap();
            replica.start();
            replicas.push(replica);
        }

        // Force replica 1 to become leader deterministically rather than
        // racing the randomized election timer.
        if let Engine::Raft(engine) = &replicas[0].engine {
            let args = engine.start_election();
            let _ = replicas[0].broadcast(ReplicaMessage::Raft(RaftWireMessage::RequestVote(args))).await;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut rx = replicas[0].submit(99, b"hello".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let result = tokio::time::timeout(Duration::from_secs(2), &mut rx).await;
        assert!(result.is_ok(), "submitted request should eventually resolve");

        for r in &replicas {
            r.shutdown();
        }
    }

    #[test]
    fn hotstuff_replica_seeds_genesis_justify_only_for_view_one_primary() {
        let config = config_for(1, 4, "hotstuff");
        let verifier = Ed25519Verifier::from_seed(1, [1u8; 32]);
        let (comm, _tx) = InProcessCommunicator::new(1);
        let replica = Replica::new(config, Arc::new(verifier), comm, Arc::new(EchoExecutor::new())).unwrap();
        assert!(replica.hotstuff_ready_justify.lock().contains_key(&1));

        let config2 = config_for(2, 4, "hotstuff");
        let verifier2 = Ed25519Verifier::from_seed(2, [2u8; 32]);
        let (comm2, _tx2) = InProcessCommunicator::new(2);
        let replica2 = Replica::new(config2, Arc::new(verifier2), comm2, Arc::new(EchoExecutor::new())).unwrap();
        assert!(!replica2.hotstuff_ready_justify.lock().contains_key(&1));
    }

    #[test]
    fn tusk_replica_has_no_hotstuff_bookkeeping_primed() {
        let config = config_for(1, 4, "tusk");
        let verifier = Ed25519Verifier::from_seed(1, [1u8; 32]);
        let (comm, _tx) = InProcessCommunicator::new(1);
        let replica = Replica::new(config, Arc::new(verifier), comm, Arc::new(EchoExecutor::new())).unwrap();
        assert!(replica.hotstuff_ready_justify.lock().is_empty());
    }
}
