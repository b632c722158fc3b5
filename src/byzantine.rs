//! Byzantine fault detection and reporting.
//!
//! Local observation only — a detected fault never edits the fixed
//! replica table (see [`crate::validator`]); it feeds evidence that
//! protocol-level quorum logic and operators can act on. Detectors here
//! complement, not replace, the protocol-level safety checks in
//! `hotstuff`/`tusk`/`raft` (duplicate-signer rejection, view/round
//! bounds, log-matching) — those reject a bad message outright, while
//! this module accumulates a pattern of behavior across messages.

use serde::{Deserialize, Serialize};

use crate::{ConsensusError, ReplicaId, Result};

/// Categories of observed Byzantine behavior.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultType {
    /// Replica signed two conflicting messages for the same view/round.
    EquivocationFault,
    /// Replica failed to respond within the expected window.
    SilentFault,
    /// Replica sent a sequence/round number out of the expected order.
    OrderingFault,
    /// Replica's signature failed verification.
    AuthenticationFault,
    /// Replica proposed or voted for a value violating protocol invariants.
    LogicalFault,
}

/// Evidence of one observed fault.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FaultReport {
    /// The replica that produced the fault.
    pub faulty_replica: ReplicaId,
    /// What kind of fault this is.
    pub fault_type: FaultType,
    /// Raw evidence (e.g. the two conflicting messages, concatenated).
    pub evidence: Vec<u8>,
    /// When this fault was recorded, milliseconds since the epoch.
    pub timestamp_ms: u64,
    /// Severity on a 1-10 scale; used only for operator triage.
    pub severity: u8,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Accumulates fault evidence for one replica's view of the cluster and
/// answers whether the cluster is still within its Byzantine tolerance.
#[derive(Debug)]
pub struct ByzantineFaultDetector {
    total_replicas: usize,
    known_faults: Vec<FaultReport>,
}

impl ByzantineFaultDetector {
    /// Build a detector for a cluster of `total_replicas` members.
    pub fn new(total_replicas: usize) -> Self {
        Self {
            total_replicas,
            known_faults: Vec::new(),
        }
    }

    /// Record equivocation: `replica_id` signed two different messages
    /// for what should have been a single value. A no-op (`Ok`, nothing
    /// recorded) if the two messages are actually identical.
    pub fn detect_equivocation(&mut self, replica_id: ReplicaId, msg1: &[u8], msg2: &[u8]) -> Result<()> {
        if msg1 == msg2 {
            return Ok(());
        }
        let mut evidence = Vec::with_capacity(msg1.len() + msg2.len());
        evidence.extend_from_slice(msg1);
        evidence.extend_from_slice(msg2);

        self.known_faults.push(FaultReport {
            faulty_replica: replica_id,
            fault_type: FaultType::EquivocationFault,
            evidence,
            timestamp_ms: now_ms(),
            severity: 9,
        });

        tracing::warn!(replica_id, "equivocation detected");
        Ok(())
    }

    /// Record a silent fault: `replica_id` produced no expected message
    /// within `timeout_ms`.
    pub fn detect_silent_fault(&mut self, replica_id: ReplicaId, timeout_ms: u64) -> Result<()> {
        self.known_faults.push(FaultReport {
            faulty_replica: replica_id,
            fault_type: FaultType::SilentFault,
            evidence: format!("no message within {timeout_ms}ms").into_bytes(),
            timestamp_ms: now_ms(),
            severity: 5,
        });

        tracing::warn!(replica_id, timeout_ms, "silent fault detected");
        Ok(())
    }

    /// Record an ordering fault: `replica_id` sent `actual` where
    /// `expected` was required. A no-op if they match.
    pub fn detect_ordering_fault(&mut self, replica_id: ReplicaId, expected: u64, actual: u64) -> Result<()> {
        if actual == expected {
            return Ok(());
        }
        self.known_faults.push(FaultReport {
            faulty_replica: replica_id,
            fault_type: FaultType::OrderingFault,
            evidence: format!("expected {expected}, got {actual}").into_bytes(),
            timestamp_ms: now_ms(),
            severity: 6,
        });

        tracing::warn!(replica_id, expected, actual, "ordering fault detected");
        Ok(())
    }

    /// Record an authentication fault: a signature purportedly from
    /// `replica_id` failed verification.
    pub fn detect_authentication_fault(&mut self, replica_id: ReplicaId, context: &str) -> Result<()> {
        self.known_faults.push(FaultReport {
            faulty_replica: replica_id,
            fault_type: FaultType::AuthenticationFault,
            evidence: context.as_bytes().to_vec(),
            timestamp_ms: now_ms(),
            severity: 8,
        });

        tracing::warn!(replica_id, context, "authentication fault detected");
        Ok(())
    }

    /// Every replica with at least one recorded fault, deduplicated,
    /// ascending by id.
    pub fn faulty_replicas(&self) -> Vec<ReplicaId> {
        let mut faulty: Vec<ReplicaId> = self
            .known_faults
            .iter()
            .map(|r| r.faulty_replica)
            .collect();
        faulty.sort_unstable();
        faulty.dedup();
        faulty
    }

    /// All recorded reports against a single replica.
    pub fn faults_for(&self, replica_id: ReplicaId) -> Vec<&FaultReport> {
        self.known_faults.iter().filter(|r| r.faulty_replica == replica_id).collect()
    }

    /// Whether the number of distinct faulty replicas is still within
    /// `⌊(n−1)/3⌋`, the BFT safety bound.
    pub fn is_system_safe(&self) -> bool {
        self.faulty_replicas().len() <= crate::max_byzantine_bft(self.total_replicas)
    }

    /// A point-in-time summary suitable for logging or an operator
    /// dashboard.
    pub fn summary(&self) -> FaultSummary {
        FaultSummary {
            total_replicas: self.total_replicas,
            faulty_replicas: self.faulty_replicas(),
            total_faults: self.known_faults.len(),
            system_safe: self.is_system_safe(),
            max_tolerable_faults: crate::max_byzantine_bft(self.total_replicas),
        }
    }
}

/// Point-in-time Byzantine fault summary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FaultSummary {
    /// Total cluster size.
    pub total_replicas: usize,
    /// Replicas with at least one recorded fault.
    pub faulty_replicas: Vec<ReplicaId>,
    /// Total fault reports recorded, across all replicas.
    pub total_faults: usize,
    /// Whether the cluster is still within its Byzantine tolerance.
    pub system_safe: bool,
    /// `⌊(n−1)/3⌋` for this cluster size.
    pub max_tolerable_faults: usize,
}

impl From<&FaultSummary> for ConsensusError {
    fn from(summary: &FaultSummary) -> Self {
        ConsensusError::ProtocolViolation(format!(
            "{} of {} replicas faulty, exceeding the {}-fault tolerance",
            summary.faulty_replicas.len(),
            summary.total_replicas,
            summary.max_tolerable_faults,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_detector_reports_no_faults() {
        let detector = ByzantineFaultDetector::new(4);
        assert!(detector.faulty_replicas().is_empty());
        assert!(detector.is_system_safe());
    }

    #[test]
    fn equivocation_on_identical_messages_is_not_a_fault() {
        let mut detector = ByzantineFaultDetector::new(4);
        detector.detect_equivocation(1, b"same", b"same").unwrap();
        assert!(detector.faulty_replicas().is_empty());
    }

    #[test]
    fn equivocation_on_conflicting_messages_is_recorded() {
        let mut detector = ByzantineFaultDetector::new(4);
        detector.detect_equivocation(1, b"vote-a", b"vote-b").unwrap();
        assert_eq!(detector.faulty_replicas(), vec![1]);
        assert_eq!(detector.faults_for(1).len(), 1);
    }

    #[test]
    fn ordering_fault_on_matching_sequence_is_not_a_fault() {
        let mut detector = ByzantineFaultDetector::new(4);
        detector.detect_ordering_fault(2, 5, 5).unwrap();
        assert!(detector.faulty_replicas().is_empty());
    }

    #[test]
    fn distinct_fault_types_accumulate_per_replica() {
        let mut detector = ByzantineFaultDetector::new(4);
        detector.detect_equivocation(0, b"a", b"b").unwrap();
        detector.detect_silent_fault(0, 5000).unwrap();
        detector.detect_ordering_fault(1, 5, 3).unwrap();

        assert_eq!(detector.faulty_replicas(), vec![0, 1]);
        assert_eq!(detector.faults_for(0).len(), 2);
    }

    #[test]
    fn system_becomes_unsafe_once_faulty_replicas_exceed_tolerance() {
        // n=4 -> f=1 tolerable.
        let mut detector = ByzantineFaultDetector::new(4);
        detector.detect_equivocation(0, b"a", b"b").unwrap();
        assert!(detector.is_system_safe());

        detector.detect_equivocation(1, b"a", b"b").unwrap();
        assert!(!detector.is_system_safe());

        let summary = detector.summary();
        assert_eq!(summary.max_tolerable_faults, 1);
        let err: ConsensusError = (&summary).into();
        assert!(matches!(err, ConsensusError::ProtocolViolation(_)));
    }
}
