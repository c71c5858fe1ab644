//! Potential-duplicate pairs flagged at write time (§3, §4.I).

use serde::{Deserialize, Serialize};

/// `{entity_guid, duplicate_guid}` — unordered in meaning, persisted as
/// given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicatePair {
    pub entity_guid: String,
    pub duplicate_guid: String,
}

impl DuplicatePair {
    pub fn new(entity_guid: impl Into<String>, duplicate_guid: impl Into<String>) -> Self {
        Self {
            entity_guid: entity_guid.into(),
            duplicate_guid: duplicate_guid.into(),
        }
    }

    /// True if this pair names both GUIDs, in either order.
    pub fn involves(&self, a: &str, b: &str) -> bool {
        (self.entity_guid == a && self.duplicate_guid == b)
            || (self.entity_guid == b && self.duplicate_guid == a)
    }
}
