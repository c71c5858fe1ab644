//! Orchestration layer wiring [`registry_core`]'s domain types to
//! [`registry_persist`]'s storage contracts: the Applier Registry, the
//! Command Pipeline built on top of it, and the [`Registry`] façade that
//! callers construct directly.
//!
//! ```no_run
//! use std::sync::Arc;
//! use registry_engine::Registry;
//! use registry_persist::MemoryBackend;
//! use registry_core::FormSubmission;
//! use serde_json::json;
//!
//! # async fn run() -> registry_core::EngineResult<()> {
//! let registry = Registry::new("tenant-1", Arc::new(MemoryBackend::new())).await?;
//! registry
//!     .submit(FormSubmission::new("e1", "g1", "create-individual", json!({"name": "Ann"}), "u1"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod applier;
pub mod facade;
pub mod pipeline;

pub use applier::{
    AddMemberApplier, Applier, ApplierContext, ApplierOutput, ApplierRegistry, CreateGroupApplier,
    CreateIndividualApplier, DeleteEntityApplier, RemoveMemberApplier, ResolveDuplicateApplier, StateOp,
    UpdateGroupApplier, UpdateIndividualApplier,
};
pub use facade::Registry;
pub use pipeline::{CommandPipeline, PipelineConfig};
