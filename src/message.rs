//! Core data-model wire types: `Request`, `Batch`, `Certificate`, and the
//! TLV wire-framing envelope.

use serde::{Deserialize, Serialize};

use crate::crypto::{content_hash, Digest, Signature};
use crate::identity::ReplicaId;
use crate::{ConsensusError, Result};

/// The kind of a `Request`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    /// A client-submitted user transaction.
    UserRequest,
    /// A batch response delivered back to a proxy.
    BatchResponse,
}

/// `{type, sender_id, seq, view, proxy_id, hash, payload, signature}`.
///
/// `seq` is assigned by the primary on commit; `hash = H(payload ∥ seq)`.
/// Invariant: once a non-faulty replica has committed `(seq, hash)`, no
/// other hash may be committed at `seq`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    /// Request kind.
    pub r#type: RequestType,
    /// Originating replica or client id.
    pub sender_id: ReplicaId,
    /// Sequence number, assigned by the primary on commit (0 until then).
    pub seq: u64,
    /// View/term under which this request was ordered.
    pub view: u64,
    /// The proxy replica the client is talking to.
    pub proxy_id: ReplicaId,
    /// Content hash, `H(payload ∥ seq)`.
    pub hash: Digest,
    /// Opaque application payload.
    pub payload: Vec<u8>,
    /// Signature over `payload` (and `seq` once assigned).
    pub signature: Option<Signature>,
}

impl Request {
    /// Build an unsequenced client request (`seq = 0`, no hash/signature
    /// yet — `assign_seq` computes the commit-time hash).
    pub fn new_user_request(sender_id: ReplicaId, proxy_id: ReplicaId, payload: Vec<u8>) -> Self {
        Self {
            r#type: RequestType::UserRequest,
            sender_id,
            seq: 0,
            view: 0,
            proxy_id,
            hash: [0u8; 32],
            payload,
            signature: None,
        }
    }

    /// Assign a commit sequence number and compute `hash = H(payload ∥ seq)`.
    pub fn assign_seq(&mut self, seq: u64, view: u64) {
        self.seq = seq;
        self.view = view;
        self.hash = Self::compute_hash(&self.payload, seq);
    }

    /// `H(payload ∥ seq)`, the invariant-bearing content hash.
    pub fn compute_hash(payload: &[u8], seq: u64) -> Digest {
        let mut bytes = payload.to_vec();
        bytes.extend_from_slice(&seq.to_be_bytes());
        content_hash(&bytes)
    }
}

/// An ordered finite sequence of [`Request`]s with `{local_id,
/// create_time}` and an aggregate hash. `local_id` is monotonic per proxy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Batch {
    /// Monotonic per-proxy batch identifier.
    pub local_id: u64,
    /// Creation timestamp, milliseconds since epoch.
    pub create_time: u64,
    /// The batched requests, applied in this order within the batch.
    pub requests: Vec<Request>,
    /// Aggregate hash over the batch's requests.
    pub aggregate_hash: Digest,
}

impl Batch {
    /// Build a batch from requests, computing the aggregate hash.
    pub fn new(local_id: u64, create_time: u64, requests: Vec<Request>) -> Self {
        let aggregate_hash = Self::compute_aggregate_hash(&requests);
        Self { local_id, create_time, requests, aggregate_hash }
    }

    fn compute_aggregate_hash(requests: &[Request]) -> Digest {
        let mut bytes = Vec::new();
        for r in requests {
            bytes.extend_from_slice(&r.hash);
        }
        content_hash(&bytes)
    }

    /// Number of requests in the batch.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether the batch carries no requests.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// `{type, view, node_info, signatures[]}`.
///
/// Invariant: `size(signatures) ≥ 2f+1` distinct signers; each signature
/// verifies against `node_info`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Certificate {
    /// What this certificate attests to (a free-form tag, e.g. the vote
    /// type it aggregates: `prepare`, `precommit`, `commit`, or a Tusk
    /// block certification).
    pub cert_type: String,
    /// View/round under which the certificate was formed.
    pub view: u64,
    /// Digest of the object being certified (a node, block, or batch).
    pub node_info: Digest,
    /// Distinct `(signer, signature)` pairs, size `≥ 2f+1`.
    pub signatures: Vec<(ReplicaId, Signature)>,
}

impl Certificate {
    /// Construct a certificate without verifying it — verification is a
    /// separate step against a live [`crate::crypto::SignatureVerifier`]
    /// and the current membership size, since the same struct is built
    /// incrementally as votes arrive.
    pub fn new(cert_type: impl Into<String>, view: u64, node_info: Digest) -> Self {
        Self { cert_type: cert_type.into(), view, node_info, signatures: Vec::new() }
    }

    /// Add a signer's vote, ignoring duplicate signers.
    pub fn add_signature(&mut self, signer: ReplicaId, signature: Signature) {
        if !self.signatures.iter().any(|(s, _)| *s == signer) {
            self.signatures.push((signer, signature));
        }
    }

    /// Number of distinct signers currently collected.
    pub fn signer_count(&self) -> usize {
        self.signatures.len()
    }

    /// Verify the certificate meets the `required` quorum and that every
    /// signature verifies against `node_info`.
    pub fn verify(&self, verifier: &dyn crate::crypto::SignatureVerifier, required: usize) -> bool {
        crate::crypto::verify_distinct_signers(verifier, &self.node_info, &self.signatures, required)
    }
}

/// Tag-length-value wire framing: a 4-byte big-endian length prefix
/// followed by a `bincode`-encoded payload. Implementations within a
/// deployment must be byte-compatible.
pub struct TlvFrame;

impl TlvFrame {
    /// Encode `value` as a length-prefixed TLV frame.
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        let payload = bincode::serialize(value)?;
        let len: u32 = payload
            .len()
            .try_into()
            .map_err(|_| ConsensusError::Serialization(bincode::ErrorKind::SizeLimit.into()))?;
        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(&payload);
        Ok(framed)
    }

    /// Decode a single length-prefixed TLV frame from the front of `bytes`,
    /// returning the decoded value and the number of bytes consumed. Returns
    /// `Ok(None)` if `bytes` does not yet contain a complete frame.
    pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<Option<(T, usize)>> {
        if bytes.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let total = 4 + len;
        if bytes.len() < total {
            return Ok(None);
        }
        let value = bincode::deserialize(&bytes[4..total])?;
        Ok(Some((value, total)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_hash_depends_on_assigned_sequence() {
        let mut r = Request::new_user_request(5, 1, b"k=v".to_vec());
        r.assign_seq(1, 1);
        let hash_at_1 = r.hash;
        r.assign_seq(2, 1);
        assert_ne!(hash_at_1, r.hash);
    }

    #[test]
    fn batch_aggregate_hash_is_order_sensitive() {
        let mut a = Request::new_user_request(1, 1, b"a".to_vec());
        a.assign_seq(1, 1);
        let mut b = Request::new_user_request(2, 1, b"b".to_vec());
        b.assign_seq(2, 1);

        let batch_ab = Batch::new(0, 0, vec![a.clone(), b.clone()]);
        let batch_ba = Batch::new(0, 0, vec![b, a]);
        assert_ne!(batch_ab.aggregate_hash, batch_ba.aggregate_hash);
    }

    #[test]
    fn certificate_ignores_duplicate_signers() {
        let mut cert = Certificate::new("prepare", 1, [0u8; 32]);
        cert.add_signature(1, vec![1, 2, 3]);
        cert.add_signature(1, vec![9, 9, 9]);
        assert_eq!(cert.signer_count(), 1);
    }

    #[test]
    fn tlv_frame_round_trips_and_reports_partial_frames() {
        let value = Batch::new(7, 1000, vec![]);
        let framed = TlvFrame::encode(&value).unwrap();

        // A truncated buffer reports "not yet a complete frame".
        let partial = &framed[..framed.len() - 1];
        let decoded: Option<(Batch, usize)> = TlvFrame::decode(partial).unwrap();
        assert!(decoded.is_none());

        let (decoded, consumed): (Batch, usize) = TlvFrame::decode(&framed).unwrap().unwrap();
        assert_eq!(consumed, framed.len());
        assert_eq!(decoded.local_id, 7);
    }
}
