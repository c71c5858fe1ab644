//! The `FormSubmission` event and its sync-level tag (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};

/// How far an event has propagated. Monotonic: `Local -> Remote ->
/// External`, never decrements (§3 invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum SyncLevel {
    Local = 0,
    Remote = 1,
    External = 2,
}

impl SyncLevel {
    /// Promotes `self` to `other` unless that would be a downgrade.
    pub fn promoted(self, other: SyncLevel) -> SyncLevel {
        self.max(other)
    }
}

/// An immutable command record (§3). Once persisted by the Event Log it is
/// never mutated, except for sync-level promotion which does not
/// participate in the Merkle leaf hash (§4.B).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormSubmission {
    pub guid: String,
    pub entity_guid: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "data")]
    pub payload: Value,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub sync_level: SyncLevel,
}

impl FormSubmission {
    pub fn new(
        guid: impl Into<String>,
        entity_guid: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            guid: guid.into(),
            entity_guid: entity_guid.into(),
            event_type: event_type.into(),
            payload,
            user_id: user_id.into(),
            timestamp: Utc::now(),
            sync_level: SyncLevel::Local,
        }
    }

    /// The bytes hashed to produce this event's Merkle leaf: canonical
    /// JSON of everything except `sync_level`, since sync-level promotion
    /// is the one permitted post-persist mutation and must not move the
    /// leaf hash (§3, §4.A).
    pub fn merkle_payload(&self) -> MerkleEventPayload<'_> {
        MerkleEventPayload {
            guid: &self.guid,
            entity_guid: &self.entity_guid,
            event_type: &self.event_type,
            payload: &self.payload,
            user_id: &self.user_id,
            timestamp: self.timestamp.to_rfc3339(),
        }
    }
}

/// The subset of `FormSubmission` fields that feed the Merkle leaf hash.
#[derive(Serialize)]
pub struct MerkleEventPayload<'a> {
    pub guid: &'a str,
    pub entity_guid: &'a str,
    pub event_type: &'a str,
    pub payload: &'a Value,
    pub user_id: &'a str,
    pub timestamp: String,
}
