//! The audit trail (§4.D): one `AuditEntry` per committed command, chained
//! to the Merkle root the event log had just before the entry was written.

use crate::event::FormSubmission;
use crate::merkle::Hash;
use crate::value::canonical_json;
use crate::event::SyncLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single audit record (§3, §4.D).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub guid: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    /// Short tag naming the command that produced this entry, e.g.
    /// `"create-individual"` or `"resolve-duplicate"`.
    pub action: String,
    pub event_guid: String,
    pub entity_guid: String,
    pub changes: Value,
    /// `SHA-256(canonical_json(event) ∥ prev_merkle_root)`, hex-encoded
    /// (§9 Open Question resolution).
    pub signature: String,
    /// Mirrors the referenced event's sync-level; promoted the same way
    /// (§4.D).
    pub sync_level: SyncLevel,
}

impl AuditEntry {
    pub fn new(
        guid: impl Into<String>,
        user_id: impl Into<String>,
        action: impl Into<String>,
        event: &FormSubmission,
        changes: Value,
        prev_merkle_root: &str,
    ) -> Self {
        let signature = compute_signature(event, prev_merkle_root);
        Self {
            guid: guid.into(),
            timestamp: Utc::now(),
            user_id: user_id.into(),
            action: action.into(),
            event_guid: event.guid.clone(),
            entity_guid: event.entity_guid.clone(),
            changes,
            signature,
            sync_level: event.sync_level,
        }
    }

    /// Recomputes the signature from `event` and `prev_merkle_root` and
    /// compares it against the stored one.
    pub fn verify(&self, event: &FormSubmission, prev_merkle_root: &str) -> bool {
        self.signature == compute_signature(event, prev_merkle_root)
    }
}

/// `SHA-256(canonical_json(event) ∥ prev_merkle_root)`.
pub fn compute_signature(event: &FormSubmission, prev_merkle_root: &str) -> String {
    let mut bytes = canonical_json(&event.merkle_payload()).expect("event payload is always serializable");
    bytes.extend_from_slice(prev_merkle_root.as_bytes());
    Hash::digest(&bytes).to_hex()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> FormSubmission {
        FormSubmission::new("e1", "ent-1", "create-individual", json!({"name": "Ann"}), "u1")
    }

    #[test]
    fn signature_verifies_against_same_inputs() {
        let e = event();
        let entry = AuditEntry::new("a1", "u1", "create-individual", &e, json!({}), "root-0");
        assert!(entry.verify(&e, "root-0"));
    }

    #[test]
    fn signature_changes_with_prev_root() {
        let e = event();
        let entry = AuditEntry::new("a1", "u1", "create-individual", &e, json!({}), "root-0");
        assert!(!entry.verify(&e, "root-1"));
    }

    #[test]
    fn signature_is_stable_for_same_inputs() {
        let e = event();
        let s1 = compute_signature(&e, "root-0");
        let s2 = compute_signature(&e, "root-0");
        assert_eq!(s1, s2);
    }
}
