//! Ordering Core — chained-HotStuff family.
//!
//! Leader-based, pipelined BFT consensus: `PREPARE → PRECOMMIT → COMMIT →
//! DECIDE`, each phase gated on a 2f+1 quorum certificate, with the next
//! view's `PREPARE` piggybacked onto `PRECOMMIT` to keep the pipeline full.
//!
//! **Open Question resolution**: the piggybacked `PREPARE` of view `v+1`
//! carried on `PRECOMMIT` is treated as *independently verified* — its own
//! 2f+1-signer certificate is checked separately from the outer
//! `PRECOMMIT` QC, the safest reading of an otherwise ambiguous wire shape.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::crypto::{content_hash, Digest, SignatureVerifier};
use crate::identity::ReplicaId;
use crate::message::{Batch, Certificate};
use crate::{bft_quorum, ConsensusError, Result};

/// A view number. Monotonic; the primary of view `v` is `(v−1) mod n + 1`.
pub type ViewNumber = u64;

/// The three voting phases, used both as message discriminants and as the
/// `type` axis of the per-view vote-aggregation table.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Gathering `PREPARE_VOTE`s.
    Prepare,
    /// Gathering `PRECOMMIT_VOTE`s.
    PreCommit,
    /// Gathering `COMMIT_VOTE`s.
    Commit,
}

/// A node in the chained-HotStuff proposal tree: `{view, hash,
/// parent_hash, payload}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalNode {
    /// View this node was proposed in.
    pub view: ViewNumber,
    /// This node's content hash.
    pub hash: Digest,
    /// Hash of the parent node this extends.
    pub parent_hash: Digest,
    /// The batch this node carries.
    pub payload: Batch,
}

impl ProposalNode {
    /// Build a new node extending `parent_hash`, deriving its own hash
    /// from `(view, parent_hash, payload.aggregate_hash)`.
    pub fn new(view: ViewNumber, parent_hash: Digest, payload: Batch) -> Self {
        let mut bytes = view.to_be_bytes().to_vec();
        bytes.extend_from_slice(&parent_hash);
        bytes.extend_from_slice(&payload.aggregate_hash);
        let hash = content_hash(&bytes);
        Self { view, hash, parent_hash, payload }
    }

    /// The genesis node: view 0, no parent, an empty payload.
    pub fn genesis() -> Self {
        Self::new(0, [0u8; 32], Batch::new(0, 0, vec![]))
    }
}

/// A quorum certificate: `2f+1` votes on the same node, for one of the
/// three pipeline phases.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuorumCertificate {
    /// Which phase this QC closes out.
    pub phase: Phase,
    /// View the QC was formed in.
    pub view: ViewNumber,
    /// Hash of the certified node.
    pub node_hash: Digest,
    /// The underlying certificate (signer set).
    pub certificate: Certificate,
}

impl QuorumCertificate {
    fn new(phase: Phase, view: ViewNumber, node_hash: Digest) -> Self {
        Self { phase, view, node_hash, certificate: Certificate::new(format!("{phase:?}"), view, node_hash) }
    }

    /// Number of distinct signers collected so far.
    pub fn signer_count(&self) -> usize {
        self.certificate.signer_count()
    }

    /// Verify the certificate carries at least `required` (`2f+1`)
    /// distinct, valid signatures over `node_hash`.
    pub fn verify(&self, verifier: &dyn SignatureVerifier, required: usize) -> bool {
        self.certificate.verify(verifier, required)
    }
}

/// The `PREPARE` of view `v+1`, piggybacked onto `PRECOMMIT` of view `v`
/// to keep the pipeline full. Carries its own node and an independently
/// formed/verified certificate — see the module-level note above.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainedPrepare {
    /// The piggybacked node for view `v+1`.
    pub node: ProposalNode,
    /// The high QC this chained node extends (from view `v`'s prepare).
    pub justify: QuorumCertificate,
}

/// A vote on a single node for a single phase, from a single replica.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vote {
    /// Phase being voted on.
    pub phase: Phase,
    /// View.
    pub view: ViewNumber,
    /// Hash of the node being voted for.
    pub node_hash: Digest,
    /// The voting replica.
    pub voter: ReplicaId,
    /// Signature over `node_hash`.
    pub signature: Vec<u8>,
}

/// Messages exchanged by the chained-HotStuff engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum HotStuffMessage {
    /// Sent to the primary of view `v+1` on decide, carrying the sender's
    /// highest known QC.
    NewView { view: ViewNumber, high_qc: Option<QuorumCertificate> },
    /// Primary broadcast: propose a node justified by `justify`.
    Prepare { node: ProposalNode, justify: QuorumCertificate },
    /// Replica → primary vote on a `PREPARE`.
    PrepareVote(Vote),
    /// Primary broadcast: the formed `prepare_qc`, plus the piggybacked
    /// next-view `PREPARE`.
    PreCommit { qc: QuorumCertificate, chained_prepare: Option<ChainedPrepare> },
    /// Replica → primary vote on a `PRECOMMIT`.
    PreCommitVote(Vote),
    /// Primary broadcast: the formed `precommit_qc`, now `locked_qc`.
    Commit { qc: QuorumCertificate },
    /// Replica → primary vote on a `COMMIT`.
    CommitVote(Vote),
    /// Primary broadcast: the formed `commit_qc`; replicas apply and
    /// advance.
    Decide { qc: QuorumCertificate },
}

/// How far behind `current_view` a message's view may lag before it is
/// dropped as stale (boundary: `-5` accepted, `-6` dropped).
const STALE_VIEW_WINDOW: i64 = 5;

/// Size of the rotating per-view bookkeeping window; the slot half a
/// window behind an arriving `PREPARE` is recycled, bounding memory for a
/// state machine that otherwise runs forever.
const GC_WINDOW: u64 = 128;

/// Per-(view, phase) vote aggregation state.
struct ReceivedEntry {
    qc: QuorumCertificate,
}

/// Per-view `NEW_VIEW` aggregation state: which senders have reported in,
/// and the highest-view QC any of them has presented so far.
struct NewViewEntry {
    senders: HashSet<ReplicaId>,
    best_qc: Option<QuorumCertificate>,
}

/// The chained-HotStuff engine for one replica.
///
/// Generalizes the `HotStuffNode`/`HotStuffConfig` pair this module
/// started from — same `Arc<DashMap>` per-view bookkeeping style, now
/// driving the full four-message pipeline instead of a single
/// `generic_commit` height check.
pub struct HotStuffEngine {
    self_id: ReplicaId,
    total_nodes: usize,
    current_view: AtomicU64,
    locked_qc: Mutex<Option<QuorumCertificate>>,
    prepare_qc: Mutex<Option<QuorumCertificate>>,
    /// Arena: nodes owned here, referenced elsewhere only by hash.
    blocks: DashMap<Digest, ProposalNode>,
    /// `received[(view, phase)] → aggregating QC`.
    received: DashMap<(ViewNumber, Phase), ReceivedEntry>,
    /// `new_view_votes[view] → aggregating NEW_VIEW senders and best QC`.
    new_view_votes: DashMap<ViewNumber, NewViewEntry>,
    committed_height: AtomicU64,
}

impl HotStuffEngine {
    /// Build a fresh engine seeded with the genesis node.
    pub fn new(self_id: ReplicaId, total_nodes: usize) -> Self {
        let genesis = ProposalNode::genesis();
        let blocks = DashMap::new();
        blocks.insert(genesis.hash, genesis);
        Self {
            self_id,
            total_nodes,
            current_view: AtomicU64::new(1),
            locked_qc: Mutex::new(None),
            prepare_qc: Mutex::new(None),
            blocks,
            received: DashMap::new(),
            new_view_votes: DashMap::new(),
            committed_height: AtomicU64::new(0),
        }
    }

    /// Current view.
    pub fn current_view(&self) -> ViewNumber {
        self.current_view.load(Ordering::Acquire)
    }

    /// BFT quorum for this engine's replica count, `2f+1`.
    fn quorum(&self) -> usize {
        bft_quorum(self.total_nodes)
    }

    /// A node extends `lockedQC.node` if it chains to it through parent
    /// links stored in the arena.
    fn extends_locked(&self, mut hash: Digest, locked_hash: Digest) -> bool {
        if hash == locked_hash {
            return true;
        }
        for _ in 0..GC_WINDOW {
            let Some(node) = self.blocks.get(&hash) else { return false };
            let parent = node.parent_hash;
            if parent == locked_hash {
                return true;
            }
            hash = parent;
        }
        false
    }

    /// `safe_node`: accept `node` only if it extends `lockedQC.node`
    /// (safety) or `node.view > lockedQC.view` (liveness).
    pub fn safe_node(&self, node: &ProposalNode) -> bool {
        let locked = self.locked_qc.lock();
        match locked.as_ref() {
            None => true,
            Some(qc) => self.extends_locked(node.hash, qc.node_hash) || node.view > qc.view,
        }
    }

    /// Whether `view` is outside the acceptance window of `current_view`
    /// (boundary: `-5` accepted, `-6` dropped).
    fn is_stale(&self, view: ViewNumber) -> bool {
        let current = self.current_view() as i64;
        (view as i64) < current - STALE_VIEW_WINDOW
    }

    /// Recycle the rotating bookkeeping slot roughly half a window behind
    /// the arriving `PREPARE`'s view.
    fn recycle_on_prepare(&self, view: ViewNumber) {
        if view < GC_WINDOW / 2 {
            return;
        }
        let recycle_view = view - GC_WINDOW / 2;
        self.received.retain(|(v, _), _| *v != recycle_view);
    }

    /// Replica-side handling of an incoming `PREPARE`. Returns the vote to
    /// send back to the primary if the node is accepted.
    pub fn on_prepare(
        &self,
        node: ProposalNode,
        justify: QuorumCertificate,
        verifier: &dyn SignatureVerifier,
    ) -> Result<Vote> {
        if self.is_stale(node.view) {
            return Err(ConsensusError::ProtocolViolation(format!(
                "stale view {} (current {})",
                node.view,
                self.current_view()
            )));
        }
        // view 0 is the unsigned bootstrap justify handed out by
        // `genesis_justify` — no round has run yet to sign a real one.
        if justify.view != 0 && !justify.verify(verifier, self.quorum()) {
            return Err(ConsensusError::ProtocolViolation(
                "justify QC below quorum or signature invalid".to_string(),
            ));
        }
        let parent_ok = node.parent_hash == justify.node_hash;
        if !parent_ok || !self.safe_node(&node) {
            return Err(ConsensusError::ProtocolViolation(
                "node does not extend justify QC or fails safe_node".to_string(),
            ));
        }
        self.blocks.insert(node.hash, node.clone());
        self.recycle_on_prepare(node.view);
        let signature = verifier.sign(&node.hash)?;
        Ok(Vote { phase: Phase::Prepare, view: node.view, node_hash: node.hash, voter: self.self_id, signature })
    }

    /// Primary-side: accumulate a vote for `(view, phase)`; returns
    /// `Some(qc)` the instant the quorum is reached. A duplicate sender per
    /// `(view, phase)` is silently dropped — not double-counted and does
    /// not re-trigger a QC once already formed.
    pub fn on_vote(&self, vote: Vote) -> Option<QuorumCertificate> {
        if self.is_stale(vote.view) {
            return None;
        }
        let mut entry = self
            .received
            .entry((vote.view, vote.phase))
            .or_insert_with(|| ReceivedEntry { qc: QuorumCertificate::new(vote.phase, vote.view, vote.node_hash) });
        if entry.qc.node_hash != vote.node_hash {
            return None; // conflicting node hash for this (view, phase)
        }
        let before = entry.qc.signer_count();
        entry.qc.certificate.add_signature(vote.voter, vote.signature);
        let after = entry.qc.signer_count();
        if before < self.quorum() && after >= self.quorum() {
            Some(entry.qc.clone())
        } else {
            None
        }
    }

    /// Replica-side handling of `PRECOMMIT`: verify and store the
    /// `prepare_qc`, and — per the chained-prepare resolution above —
    /// independently verify any piggybacked next-view `PREPARE`'s own
    /// certificate before voting on it too.
    pub fn on_precommit(
        &self,
        qc: QuorumCertificate,
        chained_prepare: Option<&ChainedPrepare>,
        verifier: &dyn SignatureVerifier,
    ) -> Result<(Vote, Option<Vote>)> {
        if !qc.verify(verifier, self.quorum()) {
            return Err(ConsensusError::ProtocolViolation("precommit QC below quorum".to_string()));
        }
        *self.prepare_qc.lock() = Some(qc.clone());
        let signature = verifier.sign(&qc.node_hash)?;
        let precommit_vote =
            Vote { phase: Phase::PreCommit, view: qc.view, node_hash: qc.node_hash, voter: self.self_id, signature };

        let chained_vote = match chained_prepare {
            None => None,
            Some(cp) => {
                if !cp.justify.verify(verifier, self.quorum()) {
                    return Err(ConsensusError::ProtocolViolation(
                        "chained prepare's own justify QC below quorum".to_string(),
                    ));
                }
                if !self.safe_node(&cp.node) {
                    return Err(ConsensusError::ProtocolViolation(
                        "chained prepare node fails safe_node".to_string(),
                    ));
                }
                self.blocks.insert(cp.node.hash, cp.node.clone());
                let sig = verifier.sign(&cp.node.hash)?;
                Some(Vote {
                    phase: Phase::Prepare,
                    view: cp.node.view,
                    node_hash: cp.node.hash,
                    voter: self.self_id,
                    signature: sig,
                })
            }
        };
        Ok((precommit_vote, chained_vote))
    }

    /// Replica-side handling of `COMMIT`: verify the `precommit_qc` and
    /// lock it. Chain-Safety invariant: `locked_qc` is only replaced by a
    /// QC of strictly greater view.
    pub fn on_commit(&self, qc: QuorumCertificate, verifier: &dyn SignatureVerifier) -> Result<Vote> {
        if !qc.verify(verifier, self.quorum()) {
            return Err(ConsensusError::ProtocolViolation("commit QC below quorum".to_string()));
        }
        {
            let mut locked = self.locked_qc.lock();
            let should_replace = match locked.as_ref() {
                None => true,
                Some(existing) => qc.view > existing.view,
            };
            if should_replace {
                *locked = Some(qc.clone());
            }
        }
        let signature = verifier.sign(&qc.node_hash)?;
        Ok(Vote { phase: Phase::Commit, view: qc.view, node_hash: qc.node_hash, voter: self.self_id, signature })
    }

    /// Replica-side handling of `DECIDE`: apply the node (advance
    /// `committed_height`) and advance `current_view` past it.
    pub fn on_decide(&self, qc: QuorumCertificate, verifier: &dyn SignatureVerifier) -> Result<ProposalNode> {
        if !qc.verify(verifier, self.quorum()) {
            return Err(ConsensusError::ProtocolViolation("decide QC below quorum".to_string()));
        }
        let node = self
            .blocks
            .get(&qc.node_hash)
            .map(|n| n.clone())
            .ok_or_else(|| ConsensusError::ProtocolViolation("decide QC references unknown node".to_string()))?;
        self.committed_height.fetch_max(node.view, Ordering::AcqRel);
        self.current_view.fetch_max(qc.view + 1, Ordering::AcqRel);
        Ok(node)
    }

    /// Primary-side: build the next `PREPARE` extending the given parent.
    pub fn make_prepare(&self, view: ViewNumber, parent_hash: Digest, payload: Batch, justify: QuorumCertificate) -> ProposalNode {
        let node = ProposalNode::new(view, parent_hash, payload);
        self.blocks.insert(node.hash, node.clone());
        let _ = justify; // caller pairs this node with `justify` when framing the Prepare message
        node
    }

    /// Primary-side: accumulate a `NEW_VIEW` for `view` from `sender`,
    /// tracking the highest-view `high_qc` presented across senders.
    /// Returns `Some(high_qc)` the instant `2f+1` distinct senders have
    /// reported in for `view`; a duplicate sender is ignored.
    pub fn on_new_view(&self, view: ViewNumber, sender: ReplicaId, high_qc: Option<QuorumCertificate>) -> Option<Option<QuorumCertificate>> {
        let mut entry = self
            .new_view_votes
            .entry(view)
            .or_insert_with(|| NewViewEntry { senders: HashSet::new(), best_qc: None });
        if !entry.senders.insert(sender) {
            return None;
        }
        if let Some(qc) = high_qc {
            let replace = entry.best_qc.as_ref().map(|best| qc.view > best.view).unwrap_or(true);
            if replace {
                entry.best_qc = Some(qc);
            }
        }
        if entry.senders.len() >= self.quorum() {
            Some(entry.best_qc.clone())
        } else {
            None
        }
    }

    /// The justify a primary uses to extend genesis when no replica has
    /// yet reported a real `high_qc` — view 0 over the genesis hash, with
    /// no signatures. [`Self::on_prepare`] special-cases `justify.view ==
    /// 0` as trivially satisfied rather than requiring a bootstrap QC that
    /// cannot exist before any round has run.
    pub fn genesis_justify() -> QuorumCertificate {
        QuorumCertificate::new(Phase::Prepare, 0, ProposalNode::genesis().hash)
    }

    /// Highest committed view (a proxy for committed height along the
    /// chain).
    pub fn committed_height(&self) -> u64 {
        self.committed_height.load(Ordering::Acquire)
    }

    /// This replica's highest known `prepare_qc`, falling back to
    /// `locked_qc` — the `high_qc` a replica reports when it sends
    /// `NEW_VIEW` to the next primary after a `DECIDE`.
    pub fn high_qc(&self) -> Option<QuorumCertificate> {
        self.prepare_qc.lock().clone().or_else(|| self.locked_qc.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519Verifier;

    fn quorum_verifier_set(n: usize) -> Vec<Ed25519Verifier> {
        (1..=n as u32).map(|i| Ed25519Verifier::from_seed(i, [i as u8; 32])).collect()
    }

    fn cross_register(verifiers: &mut [Ed25519Verifier]) {
        let keys: Vec<_> = verifiers.iter().map(|v| (v.self_id(), v.verifying_key())).collect();
        for v in verifiers.iter_mut() {
            for (id, key) in &keys {
                v.register_peer(*id, *key);
            }
        }
    }

    #[test]
    fn safe_node_accepts_anything_before_any_lock() {
        let engine = HotStuffEngine::new(1, 4);
        let node = ProposalNode::new(1, ProposalNode::genesis().hash, Batch::new(0, 0, vec![]));
        assert!(engine.safe_node(&node));
    }

    #[test]
    fn quorum_certificate_requires_two_f_plus_one_distinct_signers() {
        let mut verifiers = quorum_verifier_set(4);
        cross_register(&mut verifiers);
        let engine = HotStuffEngine::new(1, 4);
        let node_hash = [9u8; 32];

        let mut last = None;
        for v in &verifiers[..2] {
            let sig = v.sign(&node_hash).unwrap();
            last = engine.on_vote(Vote { phase: Phase::Prepare, view: 1, node_hash, voter: v.self_id(), signature: sig });
        }
        // Exactly 2 of 4 signers (quorum is 3) must not yet form a QC.
        assert!(last.is_none());

        let sig = verifiers[2].sign(&node_hash).unwrap();
        let qc = engine
            .on_vote(Vote { phase: Phase::Prepare, view: 1, node_hash, voter: verifiers[2].self_id(), signature: sig })
            .expect("3rd distinct signer forms the QC");
        assert_eq!(qc.signer_count(), 3);
    }

    #[test]
    fn duplicate_sender_does_not_double_count_towards_quorum() {
        let engine = HotStuffEngine::new(1, 4);
        let node_hash = [1u8; 32];
        let vote = |voter| Vote { phase: Phase::Prepare, view: 1, node_hash, voter, signature: vec![0] };
        assert!(engine.on_vote(vote(2)).is_none());
        assert!(engine.on_vote(vote(2)).is_none()); // duplicate, ignored
        assert!(engine.on_vote(vote(3)).is_none());
        assert!(engine.on_vote(vote(4)).is_some());
    }

    #[test]
    fn stale_view_boundary_minus_five_accepted_minus_six_dropped() {
        let engine = HotStuffEngine::new(1, 4);
        engine.current_view.store(10, Ordering::Release);
        assert!(!engine.is_stale(5)); // 10 - 5 = 5, accepted
        assert!(engine.is_stale(4)); // 10 - 6 = 4, dropped
    }

    #[test]
    fn locked_qc_only_replaced_by_strictly_greater_view() {
        let mut verifiers = quorum_verifier_set(4);
        cross_register(&mut verifiers);
        let engine = HotStuffEngine::new(1, 4);

        let qc_at = |view: u64, node_hash: Digest| {
            let mut qc = QuorumCertificate::new(Phase::PreCommit, view, node_hash);
            for v in &verifiers[..3] {
                let sig = v.sign(&node_hash).unwrap();
                qc.certificate.add_signature(v.self_id(), sig);
            }
            qc
        };

        let qc1 = qc_at(5, [1u8; 32]);
        engine.on_commit(qc1, &verifiers[0]).unwrap();
        assert_eq!(engine.locked_qc.lock().as_ref().unwrap().view, 5);

        // A QC of the *same* view must not replace the lock.
        let qc_same_view = qc_at(5, [2u8; 32]);
        engine.on_commit(qc_same_view, &verifiers[0]).unwrap();
        assert_eq!(engine.locked_qc.lock().as_ref().unwrap().node_hash, [1u8; 32]);

        // A QC of strictly greater view replaces it.
        let qc2 = qc_at(6, [3u8; 32]);
        engine.on_commit(qc2, &verifiers[0]).unwrap();
        assert_eq!(engine.locked_qc.lock().as_ref().unwrap().view, 6);
    }

    #[test]
    fn new_view_quorum_carries_the_highest_known_qc() {
        let engine = HotStuffEngine::new(1, 4);
        assert!(engine.on_new_view(2, 2, None).is_none());
        assert!(engine.on_new_view(2, 2, None).is_none()); // duplicate sender ignored

        let higher_qc = QuorumCertificate::new(Phase::PreCommit, 1, [7u8; 32]);
        assert!(engine.on_new_view(2, 3, None).is_none());
        let formed = engine
            .on_new_view(2, 4, Some(higher_qc.clone()))
            .expect("3rd distinct sender forms the quorum");
        assert_eq!(formed.unwrap().node_hash, [7u8; 32]);
    }

    #[test]
    fn genesis_justify_bootstraps_the_first_prepare_without_a_real_qc() {
        let verifier = Ed25519Verifier::from_seed(1, [1u8; 32]);
        let engine = HotStuffEngine::new(1, 4);
        let node = ProposalNode::new(1, ProposalNode::genesis().hash, Batch::new(0, 0, vec![]));
        let vote = engine.on_prepare(node, HotStuffEngine::genesis_justify(), &verifier).unwrap();
        assert_eq!(vote.view, 1);
    }

    #[test]
    fn decide_requires_a_previously_seen_node() {
        let verifiers = quorum_verifier_set(4);
        let engine = HotStuffEngine::new(1, 4);
        let mut qc = QuorumCertificate::new(Phase::Commit, 1, [42u8; 32]);
        for v in &verifiers[..3] {
            let sig = v.sign(&[42u8; 32]).unwrap();
            qc.certificate.add_signature(v.self_id(), sig);
        }
        assert!(engine.on_decide(qc, &verifiers[0]).is_err());
    }
}
