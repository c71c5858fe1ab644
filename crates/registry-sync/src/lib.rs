//! # registry-sync
//!
//! Bidirectional synchronization for the offline-first registry: an
//! internal engine that pushes/pulls against the owning server, and an
//! external sync manager that drives adapter-specific integrations.
//!
//! Both drive a [`registry_engine::Registry`] and never touch storage
//! directly, so every event they submit goes through the same applier
//! dispatch, Merkle update, and audit trail as a locally-originated one.

pub mod engine;
pub mod external;
pub mod transport;

pub use engine::{CancelToken, InternalSyncEngine, SyncConfig, SyncOutcome};
pub use external::{Credentials, ExternalAdapter, ExternalSyncManager, HttpBatchAdapter, NoopAdapter};
pub use transport::{HttpSyncTransport, PullPage, SyncTransport, TransportError};
