//! Binary Merkle tree over the ordered event log (§4.B).
//!
//! The leaf of position *i* is `SHA-256(canonical_json(event_i))`.
//! Internal nodes combine left and right children positionally as
//! `SHA-256(left_hash ∥ right_hash)`; an odd level promotes its last node
//! unchanged rather than duplicating it. The root is the hash of the
//! single top node, or the empty string when the log is empty.
//!
//! §9 tightens the source's ambiguous sibling-ordering convention: proofs
//! here are positional, each step carrying the side the sibling sits on,
//! so `verify` folds hashes the same way `rebuild` combined them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

use crate::event::FormSubmission;
use crate::value::canonical_json;

/// A SHA-256 hash, hex-encoded at the boundary.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn combine(left: &Hash, right: &Hash) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(left.0);
        hasher.update(right.0);
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Which side of its parent a proof step's sibling hash sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofDirection {
    Left,
    Right,
}

/// One step of a positional Merkle proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: Hash,
    pub side: ProofDirection,
}

pub type MerkleProof = Vec<ProofStep>;

/// Leaf hash for an event: `SHA-256(canonical_json(event))` over the
/// fields that exclude sync-level (§3: sync-level promotion must not move
/// the Merkle leaf).
pub fn leaf_hash(event: &FormSubmission) -> Hash {
    let bytes = canonical_json(&event.merkle_payload()).expect("event payload is always serializable");
    Hash::digest(&bytes)
}

/// The Merkle index over an ordered event log. Rebuilt from scratch on
/// every append (§4.B); construction is O(n) and the root getter is O(1),
/// matching the "synchronous, non-blocking" requirement in §5.
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    /// `levels[0]` are the leaf hashes in event order; each subsequent
    /// level halves (rounding up) until a single root remains.
    levels: Vec<Vec<Hash>>,
    guid_index: HashMap<String, usize>,
}

impl MerkleTree {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Rebuilds the tree from an ordered event slice (§4.B `rebuild`).
    pub fn rebuild(events: &[FormSubmission]) -> Self {
        if events.is_empty() {
            return Self::empty();
        }

        let guid_index = events
            .iter()
            .enumerate()
            .map(|(i, e)| (e.guid.clone(), i))
            .collect();

        let mut levels = Vec::new();
        let mut current: Vec<Hash> = events.iter().map(leaf_hash).collect();
        levels.push(current.clone());

        while current.len() > 1 {
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            let mut iter = current.into_iter();
            while let Some(left) = iter.next() {
                if let Some(right) = iter.next() {
                    next.push(Hash::combine(&left, &right));
                } else {
                    next.push(left);
                }
            }
            levels.push(next.clone());
            current = next;
        }

        Self { levels, guid_index }
    }

    /// Hex root, or the empty string when the log is empty (§3 invariant).
    pub fn root(&self) -> String {
        self.levels
            .last()
            .and_then(|top| top.first())
            .map(|h| h.to_hex())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Sibling hashes with side annotations from leaf to root. Empty if
    /// the event isn't present in the tree.
    pub fn proof(&self, event: &FormSubmission) -> MerkleProof {
        let Some(&start_index) = self.guid_index.get(&event.guid) else {
            return Vec::new();
        };
        let mut index = start_index;
        let mut steps = Vec::new();

        for level in &self.levels {
            if level.len() <= 1 {
                break;
            }
            let sibling_index = if index % 2 == 0 { index + 1 } else { index - 1 };
            if let Some(sibling) = level.get(sibling_index) {
                let side = if index % 2 == 0 {
                    ProofDirection::Right
                } else {
                    ProofDirection::Left
                };
                steps.push(ProofStep {
                    hash: sibling.clone(),
                    side,
                });
            }
            index /= 2;
        }

        steps
    }

    /// Recomputes the leaf and folds each proof step using the same
    /// positional convention `rebuild` used, then compares against this
    /// tree's current root.
    pub fn verify(&self, event: &FormSubmission, proof: &MerkleProof) -> bool {
        let mut current = leaf_hash(event);
        for step in proof {
            current = match step.side {
                ProofDirection::Right => Hash::combine(&current, &step.hash),
                ProofDirection::Left => Hash::combine(&step.hash, &current),
            };
        }
        current.to_hex() == self.root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(guid: &str) -> FormSubmission {
        FormSubmission::new(guid, "entity-1", "create-individual", json!({"name": guid}), "user-1")
    }

    #[test]
    fn empty_log_has_empty_root() {
        let tree = MerkleTree::rebuild(&[]);
        assert_eq!(tree.root(), "");
        assert!(tree.is_empty());
    }

    #[test]
    fn single_event_root_is_its_leaf_hash() {
        let e = event("e1");
        let tree = MerkleTree::rebuild(std::slice::from_ref(&e));
        assert_eq!(tree.root(), leaf_hash(&e).to_hex());
    }

    #[test]
    fn proof_verifies_for_every_event_even_count() {
        let events: Vec<_> = ["e1", "e2", "e3", "e4"].iter().map(|g| event(g)).collect();
        let tree = MerkleTree::rebuild(&events);
        for e in &events {
            let proof = tree.proof(e);
            assert!(!proof.is_empty());
            assert!(tree.verify(e, &proof));
        }
    }

    #[test]
    fn proof_verifies_with_odd_count_promotion() {
        let events: Vec<_> = ["e1", "e2", "e3"].iter().map(|g| event(g)).collect();
        let tree = MerkleTree::rebuild(&events);
        for e in &events {
            let proof = tree.proof(e);
            assert!(tree.verify(e, &proof));
        }
    }

    #[test]
    fn rebuild_is_deterministic_as_log_grows() {
        let mut events = Vec::new();
        for i in 0..7 {
            events.push(event(&format!("e{i}")));
            let tree_a = MerkleTree::rebuild(&events);
            let tree_b = MerkleTree::rebuild(&events);
            assert_eq!(tree_a.root(), tree_b.root());
        }
    }

    #[test]
    fn tampered_proof_fails_verification() {
        let events: Vec<_> = ["e1", "e2"].iter().map(|g| event(g)).collect();
        let tree = MerkleTree::rebuild(&events);
        let mut proof = tree.proof(&events[0]);
        proof[0].hash = Hash::digest(b"tampered");
        assert!(!tree.verify(&events[0], &proof));
    }

    #[test]
    fn unknown_event_has_empty_proof() {
        let events: Vec<_> = ["e1", "e2"].iter().map(|g| event(g)).collect();
        let tree = MerkleTree::rebuild(&events);
        let stranger = event("not-in-tree");
        assert!(tree.proof(&stranger).is_empty());
    }
}
