//! Free-form payload access.
//!
//! Event and entity payloads are `serde_json::Value` objects (§9 "Flexible
//! payload"). This module adds dotted-path lookup so search predicates and
//! appliers can reach nested fields without a bespoke query language (a
//! Non-goal per §1).

use serde_json::Value;

/// Read a `.`-separated path out of a JSON value, e.g. `"address.city"`.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Canonical JSON encoding (RFC 8785 / JCS: sorted keys, no insignificant
/// whitespace) used for Merkle leaves and audit signatures (§4.B, §9).
pub fn canonical_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_jcs::to_vec(value).map_err(|e| serde::ser::Error::custom(e.to_string()))
}
