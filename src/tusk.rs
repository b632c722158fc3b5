//! Ordering Core — Tusk family.
//!
//! DAG-based mempool and ordering: replicas broadcast round-numbered
//! blocks referencing `2f+1` certified parents from the prior round
//! (strong parents) plus any number of older, not-yet-referenced blocks
//! (weak parents); a rotating leader's block every two rounds anchors a
//! deterministic commit once enough later rounds causally reference it.
//!
//! Grounded on `resdb::tusk::{ProposalManager, Tusk}` (`protocol/
//! proposal_manager.{h,cc}`, `protocol/tusk.{h,cc}`): the certificate-list
//! keyed by round/sender, `latest_cert_from_sender_` weak-parent lookup,
//! `GetLeader`, and the round-rotation (`received_stop_`, `SwitchDAG`)
//! shape carry over; the condition-variable commit/execute threads are
//! replaced by an explicit `try_commit` call per the message-passing
//! re-architecture rule.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::crypto::{content_hash, Digest, SignatureVerifier};
use crate::identity::ReplicaId;
use crate::message::{Batch, Certificate};
use crate::{bft_quorum, ConsensusError, Result};

/// A DAG round number.
pub type Round = u64;

/// A block in the DAG: `{round, proposer, strong_parents, weak_parents,
/// payload}`. Hash covers round, proposer, and parent hashes so it
/// commits to the full causal position.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalBlock {
    /// The round this block was proposed in.
    pub round: Round,
    /// The replica that proposed it.
    pub proposer: ReplicaId,
    /// This block's content hash.
    pub hash: Digest,
    /// `2f+1` certified parents from `round - 1`.
    pub strong_parents: Vec<Digest>,
    /// Older, not-yet-referenced blocks this one also links to.
    pub weak_parents: Vec<Digest>,
    /// The batch this block carries.
    pub payload: Batch,
}

impl ProposalBlock {
    /// Build a new block, deriving its hash from round/proposer/parents.
    pub fn new(
        round: Round,
        proposer: ReplicaId,
        strong_parents: Vec<Digest>,
        weak_parents: Vec<Digest>,
        payload: Batch,
    ) -> Self {
        let mut bytes = round.to_be_bytes().to_vec();
        bytes.extend_from_slice(&proposer.to_be_bytes());
        for p in &strong_parents {
            bytes.extend_from_slice(p);
        }
        for p in &weak_parents {
            bytes.extend_from_slice(p);
        }
        bytes.extend_from_slice(&payload.aggregate_hash);
        let hash = content_hash(&bytes);
        Self { round, proposer, hash, strong_parents, weak_parents, payload }
    }

    /// The round-0 genesis block for one proposer: no parents.
    pub fn genesis(proposer: ReplicaId) -> Self {
        Self::new(0, proposer, vec![], vec![], Batch::new(0, 0, vec![]))
    }
}

/// An acknowledgement of a proposed block, the unit vote aggregated into
/// a block's certificate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ack {
    /// Hash of the acknowledged block.
    pub block_hash: Digest,
    /// The acknowledging replica.
    pub voter: ReplicaId,
    /// Signature over `block_hash`.
    pub signature: Vec<u8>,
}

/// The DAG store: blocks and their certificates, indexed for both
/// by-hash lookup and by-round/by-proposer traversal.
struct DagStore {
    blocks: DashMap<Digest, ProposalBlock>,
    /// `(round, proposer) → hash`, for the strong/weak-parent search.
    by_round_proposer: DashMap<(Round, ReplicaId), Digest>,
    /// Accumulating or finished certificates, keyed by block hash.
    certificates: DashMap<Digest, Certificate>,
    /// Most recent *certified* block's hash for each proposer, walked
    /// backward to discover weak-parent candidates.
    latest_cert_from_sender: DashMap<ReplicaId, Digest>,
}

impl DagStore {
    fn new() -> Self {
        Self {
            blocks: DashMap::new(),
            by_round_proposer: DashMap::new(),
            certificates: DashMap::new(),
            latest_cert_from_sender: DashMap::new(),
        }
    }

    fn insert_block(&self, block: ProposalBlock) {
        self.by_round_proposer.insert((block.round, block.proposer), block.hash);
        self.blocks.insert(block.hash, block);
    }

    fn certified_at_round(&self, round: Round, quorum: usize) -> Vec<Digest> {
        self.by_round_proposer
            .iter()
            .filter(|e| e.key().0 == round)
            .map(|e| *e.value())
            .filter(|hash| self.certificates.get(hash).map(|c| c.signer_count() >= quorum).unwrap_or(false))
            .collect()
    }
}

/// Deterministic `leader(round) = (round/2) mod n + 1`; only even rounds
/// have an anchor role, odd rounds piggyback votes for the prior anchor.
pub fn leader(round: Round, total_nodes: usize) -> ReplicaId {
    (((round / 2) % total_nodes as u64) + 1) as ReplicaId
}

/// The Tusk DAG engine for one replica.
pub struct TuskEngine {
    self_id: ReplicaId,
    total_nodes: usize,
    current_round: AtomicU64,
    dag: DagStore,
    received_stop: Mutex<HashSet<ReplicaId>>,
    dag_id: AtomicU64,
    last_committed_round: AtomicU64,
}

impl TuskEngine {
    /// Build a fresh engine.
    pub fn new(self_id: ReplicaId, total_nodes: usize) -> Self {
        let dag = DagStore::new();
        for proposer in 1..=total_nodes as ReplicaId {
            let genesis = ProposalBlock::genesis(proposer);
            let mut cert = Certificate::new("tusk_block", 0, genesis.hash);
            for voter in 1..=total_nodes as ReplicaId {
                cert.add_signature(voter, vec![]); // genesis is certified by fiat
            }
            dag.latest_cert_from_sender.insert(proposer, genesis.hash);
            dag.certificates.insert(genesis.hash, cert);
            dag.insert_block(genesis);
        }
        Self {
            self_id,
            total_nodes,
            current_round: AtomicU64::new(1),
            dag,
            received_stop: Mutex::new(HashSet::new()),
            dag_id: AtomicU64::new(0),
            last_committed_round: AtomicU64::new(0),
        }
    }

    fn quorum(&self) -> usize {
        bft_quorum(self.total_nodes)
    }

    /// Current DAG round this replica is building.
    pub fn current_round(&self) -> Round {
        self.current_round.load(Ordering::Acquire)
    }

    /// Weak-parent candidates: blocks from `latest_cert_from_sender` not
    /// already reachable as a strong parent, walked backward per sender
    /// until one not yet referenced by the current round's accumulated
    /// strong set is found.
    fn weak_parent_candidates(&self, strong_parents: &[Digest]) -> Vec<Digest> {
        let strong: HashSet<Digest> = strong_parents.iter().copied().collect();
        self.dag
            .latest_cert_from_sender
            .iter()
            .map(|e| *e.value())
            .filter(|hash| !strong.contains(hash))
            .collect()
    }

    /// Build this replica's proposal for `round`, referencing the prior
    /// round's certified ("strong") parents plus any weak parents.
    pub fn propose(&self, payload: Batch) -> Result<ProposalBlock> {
        let round = self.current_round();
        let strong_parents = if round == 0 {
            vec![]
        } else {
            let parents = self.dag.certified_at_round(round - 1, self.quorum());
            if parents.len() < self.quorum() {
                return Err(ConsensusError::QuorumTimeout(format!(
                    "round {} has only {} certified parents, need {}",
                    round - 1,
                    parents.len(),
                    self.quorum()
                )));
            }
            parents
        };
        let weak_parents = self.weak_parent_candidates(&strong_parents);
        let block = ProposalBlock::new(round, self.self_id, strong_parents, weak_parents, payload);
        self.dag.insert_block(block.clone());
        Ok(block)
    }

    /// Validate and acknowledge an incoming block: its strong parents
    /// must all already be certified at `round - 1` (or `round == 0`).
    pub fn on_receive_block(&self, block: ProposalBlock, verifier: &dyn SignatureVerifier) -> Result<Ack> {
        if block.round > 0 {
            for parent in &block.strong_parents {
                let certified =
                    self.dag.certificates.get(parent).map(|c| c.signer_count() >= self.quorum()).unwrap_or(false);
                if !certified {
                    return Err(ConsensusError::ProtocolViolation(format!(
                        "strong parent {parent:?} not yet certified"
                    )));
                }
            }
            if block.strong_parents.len() < self.quorum() {
                return Err(ConsensusError::ProtocolViolation(
                    "block references fewer than 2f+1 strong parents".to_string(),
                ));
            }
        }
        self.dag.insert_block(block.clone());
        let signature = verifier.sign(&block.hash)?;
        Ok(Ack { block_hash: block.hash, voter: self.self_id, signature })
    }

    /// Accumulate an `Ack`; returns the certificate the instant quorum is
    /// reached (idempotent past that point).
    pub fn on_ack(&self, ack: Ack) -> Option<Certificate> {
        let Some(block) = self.dag.blocks.get(&ack.block_hash).map(|b| b.clone()) else {
            return None;
        };
        let mut cert = self
            .dag
            .certificates
            .entry(ack.block_hash)
            .or_insert_with(|| Certificate::new("tusk_block", block.round, ack.block_hash));
        let before = cert.signer_count();
        cert.add_signature(ack.voter, ack.signature);
        let after = cert.signer_count();
        if before < self.quorum() && after >= self.quorum() {
            self.dag.latest_cert_from_sender.insert(block.proposer, ack.block_hash);
            if self.current_round() == block.round {
                self.current_round.fetch_add(1, Ordering::AcqRel);
            }
            Some(cert.clone())
        } else {
            None
        }
    }

    /// Adopt a block and its certificate as received from the network
    /// (the proposer's broadcast `Cert` after step 3 of the flow): stores
    /// both in the arena and updates `latest_cert_from_sender` exactly as
    /// the locally-certified path in [`Self::on_ack`] does, so a replica
    /// that never saw the individual `Ack`s still ends up with a usable
    /// strong-parent candidate for future rounds.
    pub fn adopt_cert(&self, block: ProposalBlock, cert: Certificate, verifier: &dyn SignatureVerifier) -> Result<()> {
        if !cert.verify(verifier, self.quorum()) {
            return Err(ConsensusError::ProtocolViolation(
                "certificate below quorum or signature invalid".to_string(),
            ));
        }
        if cert.node_info != block.hash {
            return Err(ConsensusError::ProtocolViolation(
                "certificate does not attest to the accompanying block".to_string(),
            ));
        }
        self.dag.insert_block(block.clone());
        self.dag.certificates.insert(block.hash, cert);
        self.dag.latest_cert_from_sender.insert(block.proposer, block.hash);
        if self.current_round() == block.round {
            self.current_round.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Count of rounds at or after `round + 2` that causally reference
    /// `anchor` through a strong-parent chain — the "enough later rounds
    /// reference the anchor" commit test, scanned every two rounds.
    fn reference_count(&self, anchor: Digest, through_round: Round) -> usize {
        let mut visited = HashSet::new();
        let mut frontier: VecDeque<Digest> =
            self.dag.by_round_proposer.iter().filter(|e| e.key().0 == through_round).map(|e| *e.value()).collect();
        let mut referencing = HashSet::new();
        while let Some(hash) = frontier.pop_front() {
            if !visited.insert(hash) {
                continue;
            }
            let Some(block) = self.dag.blocks.get(&hash).map(|b| b.clone()) else { continue };
            if block.strong_parents.contains(&anchor) || block.weak_parents.contains(&anchor) {
                referencing.insert(block.proposer);
                continue;
            }
            for parent in block.strong_parents.iter().chain(block.weak_parents.iter()) {
                frontier.push_back(*parent);
            }
        }
        referencing.len()
    }

    /// Attempt to commit the anchor (leader's block) of `round`: requires
    /// `round` even and at least `quorum()` distinct-proposer blocks two
    /// rounds later referencing it. Returns the deterministically
    /// linearized commit sequence if the anchor commits.
    pub fn try_commit(&self, round: Round) -> Option<Vec<ProposalBlock>> {
        if round % 2 != 0 || round <= self.last_committed_round.load(Ordering::Acquire) {
            return None;
        }
        let leader_id = leader(round, self.total_nodes);
        let anchor_hash = *self.dag.by_round_proposer.get(&(round, leader_id))?;
        if self.reference_count(anchor_hash, round + 2) < self.quorum() {
            return None;
        }
        let sequence = self.linearize(anchor_hash);
        self.last_committed_round.store(round, Ordering::Release);
        Some(sequence)
    }

    /// Deterministic linearization: BFS the anchor's causal history,
    /// group by round, order each round's blocks by `(round,
    /// proposer_id)`.
    fn linearize(&self, anchor: Digest) -> Vec<ProposalBlock> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([anchor]);
        let mut collected = Vec::new();
        while let Some(hash) = queue.pop_front() {
            if !visited.insert(hash) {
                continue;
            }
            let Some(block) = self.dag.blocks.get(&hash).map(|b| b.clone()) else { continue };
            for parent in block.strong_parents.iter().chain(block.weak_parents.iter()) {
                queue.push_back(*parent);
            }
            collected.push(block);
        }
        collected.sort_by_key(|b| (b.round, b.proposer));
        collected
    }

    /// Record that `sender` requested this DAG instance stop (prior to a
    /// rotation); `should_rotate` reports once `2f+1` distinct senders
    /// have asked.
    pub fn note_stop(&self, sender: ReplicaId) -> bool {
        let mut stops = self.received_stop.lock();
        stops.insert(sender);
        stops.len() >= self.quorum()
    }

    /// Rotate to a fresh DAG instance once `should_rotate` would report
    /// true, resetting round bookkeeping but keeping the replica's
    /// identity and membership.
    pub fn rotate(&self) -> u64 {
        self.received_stop.lock().clear();
        self.current_round.store(1, Ordering::Release);
        self.last_committed_round.store(0, Ordering::Release);
        self.dag_id.fetch_add(1, Ordering::AcqRel)
    }

    /// The active DAG instance id (bumped on each [`rotate`]).
    pub fn dag_id(&self) -> u64 {
        self.dag_id.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Ed25519Verifier;

    fn verifiers(n: usize) -> Vec<Ed25519Verifier> {
        (1..=n as u32).map(|i| Ed25519Verifier::from_seed(i, [i as u8; 32])).collect()
    }

    fn cross_registered_verifiers(n: usize) -> Vec<Ed25519Verifier> {
        let mut vs = verifiers(n);
        let keys: Vec<_> = vs.iter().map(|v| (v.self_id(), v.verifying_key())).collect();
        for v in vs.iter_mut() {
            for (id, key) in &keys {
                v.register_peer(*id, *key);
            }
        }
        vs
    }

    #[test]
    fn leader_rotates_every_two_rounds_mod_n() {
        assert_eq!(leader(0, 4), 1);
        assert_eq!(leader(1, 4), 1);
        assert_eq!(leader(2, 4), 2);
        assert_eq!(leader(8, 4), 1);
    }

    #[test]
    fn propose_at_round_zero_needs_no_parents() {
        let engine = TuskEngine::new(1, 4);
        let block = engine.propose(Batch::new(0, 0, vec![])).unwrap();
        assert_eq!(block.round, 0);
        assert!(block.strong_parents.is_empty());
    }

    #[test]
    fn propose_fails_without_enough_certified_parents_at_prior_round() {
        let engine = TuskEngine::new(1, 4);
        engine.current_round.store(5, Ordering::Release);
        assert!(engine.propose(Batch::new(0, 0, vec![])).is_err());
    }

    #[test]
    fn ack_quorum_certifies_a_block_and_advances_latest_cert() {
        let vs = verifiers(4);
        let engine = TuskEngine::new(1, 4);
        let block = engine.propose(Batch::new(0, 0, vec![])).unwrap();

        let mut last = None;
        for v in &vs[..3] {
            let sig = v.sign(&block.hash).unwrap();
            last = engine.on_ack(Ack { block_hash: block.hash, voter: v.self_id(), signature: sig });
        }
        let cert = last.expect("3rd ack forms the certificate");
        assert_eq!(cert.signer_count(), 3);
        assert_eq!(*engine.dag.latest_cert_from_sender.get(&1).unwrap(), block.hash);
    }

    #[test]
    fn rotation_requires_two_f_plus_one_distinct_stop_requests() {
        let engine = TuskEngine::new(1, 4);
        assert!(!engine.note_stop(2));
        assert!(!engine.note_stop(2)); // duplicate sender does not count twice
        assert!(!engine.note_stop(3));
        assert!(engine.note_stop(4));
    }

    #[test]
    fn adopt_cert_rejects_a_certificate_below_quorum() {
        let vs = cross_registered_verifiers(4);
        let proposer_engine = TuskEngine::new(1, 4);
        let block = proposer_engine.propose(Batch::new(0, 0, vec![])).unwrap();

        let mut cert = Certificate::new("tusk_block", block.round, block.hash);
        let sig = vs[1].sign(&block.hash).unwrap();
        cert.add_signature(2, sig);

        let receiver = TuskEngine::new(2, 4);
        assert!(receiver.adopt_cert(block, cert, &vs[1]).is_err());
    }

    #[test]
    fn adopt_cert_stores_block_and_advances_latest_sender_cert() {
        let vs = cross_registered_verifiers(4);
        let proposer_engine = TuskEngine::new(1, 4);
        let block = proposer_engine.propose(Batch::new(0, 0, vec![])).unwrap();

        let mut cert = Certificate::new("tusk_block", block.round, block.hash);
        for v in &vs[..3] {
            let sig = v.sign(&block.hash).unwrap();
            cert.add_signature(v.self_id(), sig);
        }

        let receiver = TuskEngine::new(2, 4);
        receiver.adopt_cert(block.clone(), cert, &vs[0]).unwrap();
        assert_eq!(*receiver.dag.latest_cert_from_sender.get(&1).unwrap(), block.hash);
    }

    #[test]
    fn linearize_orders_by_round_then_proposer() {
        let engine = TuskEngine::new(1, 4);
        // genesis blocks for proposers 1..=4 at round 0
        let anchor = *engine.dag.by_round_proposer.get(&(0, 1)).unwrap();
        let seq = engine.linearize(anchor);
        assert_eq!(seq.len(), 1);
        assert_eq!(seq[0].proposer, 1);
    }
}
