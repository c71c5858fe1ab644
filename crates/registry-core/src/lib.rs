//! # registry-core
//!
//! Pure, synchronous domain types for the offline-first data-collection
//! registry: entities, events, audit entries, and the Merkle index that
//! binds them together.
//!
//! ## Quick start
//!
//! ```rust
//! use registry_core::{FormSubmission, MerkleTree};
//! use serde_json::json;
//!
//! let events = vec![FormSubmission::new(
//!     "e1",
//!     "entity-1",
//!     "create-individual",
//!     json!({"name": "Ann"}),
//!     "user-1",
//! )];
//!
//! let tree = MerkleTree::rebuild(&events);
//! let proof = tree.proof(&events[0]);
//! assert!(tree.verify(&events[0], &proof));
//! ```

pub mod audit;
pub mod duplicate;
pub mod entity;
pub mod error;
pub mod event;
pub mod merkle;
pub mod value;

pub use audit::AuditEntry;
pub use duplicate::DuplicatePair;
pub use entity::{EntityKind, EntityPair, EntitySnapshot};
pub use error::{EngineError, EngineResult};
pub use event::{FormSubmission, MerkleEventPayload, SyncLevel};
pub use merkle::{Hash, MerkleProof, MerkleTree, ProofDirection, ProofStep};
pub use value::{canonical_json, get_path};
