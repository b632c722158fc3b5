//! Crypto Adapter: sign / verify / hash, keyed per replica.
//!
//! The adapter holds the private key exclusively and the ordered table of
//! peer public keys keyed by `node_id`. Concrete cryptographic primitives
//! other than ED25519 are out of scope (the spec specifies this component
//! only as a `SignatureVerifier` capability) — `SignatureScheme` still
//! enumerates all four configured variants so configuration round-trips
//! and deployments can record their intended scheme.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use sha3::Sha3_256;
use std::collections::BTreeMap;

use crate::identity::ReplicaId;
use crate::{ConsensusError, Result};

/// The four signature schemes the source system's configuration
/// enumerates. Only `Ed25519` has a concrete in-crate implementation; the
/// others select the variant tag but require an external `SignatureVerifier`
/// to actually operate, consistent with the crypto primitives being
/// out-of-scope collaborators.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignatureScheme {
    /// RSA signatures (external collaborator).
    Rsa,
    /// ED25519 signatures (implemented in-crate).
    #[default]
    Ed25519,
    /// CMAC-AES (external collaborator).
    CmacAes,
    /// ECDSA (external collaborator).
    Ecdsa,
}

/// An opaque signature produced by a [`SignatureVerifier`].
pub type Signature = Vec<u8>;

/// A 32-byte content digest.
pub type Digest = [u8; 32];

/// Capability trait for signing, verifying, and hashing.
///
/// Replaces the source system's per-scheme concrete classes (virtual
/// dispatch on `SignatureScheme`) with a single trait object the protocol
/// engines hold by handle, per the capability-trait re-architecture rule.
pub trait SignatureVerifier: Send + Sync {
    /// Sign `msg_bytes` with this replica's private key.
    fn sign(&self, msg_bytes: &[u8]) -> Result<Signature>;

    /// Verify that `signature` over `msg_bytes` was produced by `signer`.
    fn verify(&self, msg_bytes: &[u8], signature: &Signature, signer: ReplicaId) -> bool;

    /// Content hash used for block/request/certificate digests.
    fn hash(&self, bytes: &[u8]) -> Digest;

    /// Admin-only: produce a certificate binding a peer's public key info.
    /// Returns the signature over the provided `pub_key_info` bytes.
    fn sign_cert(&self, pub_key_info: &[u8]) -> Result<Signature> {
        self.sign(pub_key_info)
    }

    /// This replica's own id.
    fn self_id(&self) -> ReplicaId;
}

/// ED25519-backed implementation of [`SignatureVerifier`], holding the
/// local signing key and the ordered table of peer verifying keys.
pub struct Ed25519Verifier {
    self_id: ReplicaId,
    signing_key: SigningKey,
    peer_keys: BTreeMap<ReplicaId, VerifyingKey>,
}

impl Ed25519Verifier {
    /// Construct a verifier for `self_id`, generating a fresh signing key
    /// (e.g. for tests) and registering peer public keys.
    pub fn new(self_id: ReplicaId, signing_key: SigningKey, peer_keys: BTreeMap<ReplicaId, VerifyingKey>) -> Self {
        Self { self_id, signing_key, peer_keys }
    }

    /// Convenience constructor that derives a signing key from a seed and
    /// registers no peers; intended for unit tests.
    pub fn from_seed(self_id: ReplicaId, seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let mut peer_keys = BTreeMap::new();
        peer_keys.insert(self_id, signing_key.verifying_key());
        Self { self_id, signing_key, peer_keys }
    }

    /// Register (or replace) a peer's verifying key.
    pub fn register_peer(&mut self, id: ReplicaId, key: VerifyingKey) {
        self.peer_keys.insert(id, key);
    }

    /// This replica's own verifying key, for distribution to peers.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn sign(&self, msg_bytes: &[u8]) -> Result<Signature> {
        Ok(self.signing_key.sign(msg_bytes).to_bytes().to_vec())
    }

    fn verify(&self, msg_bytes: &[u8], signature: &Signature, signer: ReplicaId) -> bool {
        let Some(key) = self.peer_keys.get(&signer) else {
            return false;
        };
        let Ok(sig_bytes): std::result::Result<[u8; 64], _> = signature.as_slice().try_into() else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        key.verify(msg_bytes, &sig).is_ok()
    }

    fn hash(&self, bytes: &[u8]) -> Digest {
        content_hash(bytes)
    }

    fn self_id(&self) -> ReplicaId {
        self.self_id
    }
}

/// Content hash used throughout the data model for Requests, Batches,
/// ProposalNodes, and DAG blocks: SHA3-256 over a deterministic (`bincode`)
/// encoding, generalizing the ambient crate's `SHA3` content-hash pattern.
pub fn content_hash(bytes: &[u8]) -> Digest {
    let mut hasher = Sha3_256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// State/snapshot hash, kept on SHA2-256 to preserve the ambient crate's
/// two-hash-function split between content digests (SHA3) and state
/// digests (SHA2).
pub fn state_hash(bytes: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Check that a certificate's signer set is large enough and free of
/// duplicates — the common "certificate accepted iff every embedded
/// signature verifies and is from a distinct signer" rule from §4.3.
pub fn verify_distinct_signers(
    verifier: &dyn SignatureVerifier,
    msg_bytes: &[u8],
    signatures: &[(ReplicaId, Signature)],
    required: usize,
) -> bool {
    let mut seen = std::collections::HashSet::new();
    let mut valid = 0usize;
    for (signer, sig) in signatures {
        if !seen.insert(*signer) {
            continue; // duplicate signer, ignore per distinct-signer rule
        }
        if verifier.verify(msg_bytes, sig, *signer) {
            valid += 1;
        }
    }
    valid >= required
}

/// Convenience: turn a verification failure into the crate's error type.
pub fn require_signature(ok: bool, context: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(ConsensusError::CryptoError(context.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed25519_round_trips_sign_and_verify() {
        let v = Ed25519Verifier::from_seed(1, [7u8; 32]);
        let msg = b"hello resilientdb";
        let sig = v.sign(msg).unwrap();
        assert!(v.verify(msg, &sig, 1));
        assert!(!v.verify(b"tampered", &sig, 1));
    }

    #[test]
    fn verify_fails_for_unregistered_signer() {
        let v = Ed25519Verifier::from_seed(1, [7u8; 32]);
        let sig = v.sign(b"msg").unwrap();
        assert!(!v.verify(b"msg", &sig, 2));
    }

    #[test]
    fn distinct_signers_rejects_duplicates_even_if_individually_valid() {
        let v = Ed25519Verifier::from_seed(1, [3u8; 32]);
        let msg = b"cert payload";
        let sig = v.sign(msg).unwrap();
        // same signer counted twice must not satisfy a quorum of 2
        let sigs = vec![(1, sig.clone()), (1, sig)];
        assert!(!verify_distinct_signers(&v, msg, &sigs, 2));
    }

    #[test]
    fn content_hash_is_deterministic() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
    }
}
