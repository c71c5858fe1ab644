//! Entity snapshots and the initial/modified pair held per GUID (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Distinguishes an `Individual` from a `Group` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Individual,
    Group,
}

/// A materialized entity snapshot. `member_ids` is only meaningful for
/// `EntityKind::Group`; it stays empty for an Individual.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Internal id assigned by the storage backend (opaque to the core).
    pub internal_id: String,
    pub guid: String,
    pub kind: EntityKind,
    pub version: u64,
    pub data: Value,
    pub last_updated: DateTime<Utc>,
    pub display_name: Option<String>,
    pub external_id: Option<String>,
    /// Ordered, duplicate-free list of member GUIDs. Groups only.
    pub member_ids: Vec<String>,
}

impl EntitySnapshot {
    pub fn new_individual(internal_id: impl Into<String>, guid: impl Into<String>, data: Value) -> Self {
        Self {
            internal_id: internal_id.into(),
            guid: guid.into(),
            kind: EntityKind::Individual,
            version: 1,
            data,
            last_updated: Utc::now(),
            display_name: None,
            external_id: None,
            member_ids: Vec::new(),
        }
    }

    pub fn new_group(internal_id: impl Into<String>, guid: impl Into<String>, data: Value) -> Self {
        Self {
            internal_id: internal_id.into(),
            guid: guid.into(),
            kind: EntityKind::Group,
            version: 1,
            data,
            last_updated: Utc::now(),
            display_name: None,
            external_id: None,
            member_ids: Vec::new(),
        }
    }

    /// Bumps the version and refreshes `last_updated`. Every applier that
    /// mutates a snapshot in place must call this (invariant: version
    /// monotonicity, §3).
    pub fn bump_version(&mut self) {
        self.version += 1;
        self.last_updated = Utc::now();
    }

    /// Appends a member GUID if not already present (Group membership is
    /// an insertion-ordered, duplicate-free list, §3).
    pub fn add_member(&mut self, member_guid: impl Into<String>) {
        let member_guid = member_guid.into();
        if !self.member_ids.contains(&member_guid) {
            self.member_ids.push(member_guid);
        }
    }

    pub fn remove_member(&mut self, member_guid: &str) {
        self.member_ids.retain(|m| m != member_guid);
    }
}

/// The `{initial, modified}` pair a state store keeps per GUID (§3).
///
/// `initial` is the snapshot last synchronized upstream (or the creation
/// snapshot before any sync); `modified` is the current snapshot. Equal
/// versions mean "locally clean".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityPair {
    pub initial: EntitySnapshot,
    pub modified: EntitySnapshot,
}

impl EntityPair {
    pub fn new(snapshot: EntitySnapshot) -> Self {
        Self {
            initial: snapshot.clone(),
            modified: snapshot,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.initial.version == self.modified.version
    }

    /// `mark_synced`: copies `modified` into `initial` (§4.C).
    pub fn mark_synced(&mut self) {
        self.initial = self.modified.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bump_version_increments_and_touches_timestamp() {
        let mut e = EntitySnapshot::new_individual("1", "g1", json!({}));
        let before = e.last_updated;
        std::thread::sleep(std::time::Duration::from_millis(2));
        e.bump_version();
        assert_eq!(e.version, 2);
        assert!(e.last_updated >= before);
    }

    #[test]
    fn add_member_is_idempotent_and_ordered() {
        let mut g = EntitySnapshot::new_group("1", "g1", json!({}));
        g.add_member("m1");
        g.add_member("m2");
        g.add_member("m1");
        assert_eq!(g.member_ids, vec!["m1".to_string(), "m2".to_string()]);
    }

    #[test]
    fn mark_synced_equalizes_pair() {
        let snapshot = EntitySnapshot::new_individual("1", "g1", json!({}));
        let mut pair = EntityPair::new(snapshot);
        pair.modified.bump_version();
        assert!(!pair.is_clean());
        pair.mark_synced();
        assert!(pair.is_clean());
    }
}
