//! The top-level façade (§4.J): a single handle a caller constructs once
//! per tenant, aggregating the Command Pipeline's submit/query/audit
//! surfaces behind one type, the way an orchestrator wraps an executor
//! and config behind one entry point rather than making callers wire the
//! pieces themselves.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use registry_core::{AuditEntry, DuplicatePair, EngineResult, EntityPair, EntitySnapshot, FormSubmission, MerkleProof};
use registry_persist::{SearchCriteria, StorageBackend, SyncTimestampKind};

use crate::applier::ApplierRegistry;
use crate::pipeline::{CommandPipeline, PipelineConfig};

/// Tenant-scoped entry point wiring the Applier Registry to the storage
/// layer through a [`CommandPipeline`]. One instance per tenant per
/// process is the expected shape; constructing it twice over the same
/// backend and tenant is safe but redundant (§4.F startup integrity
/// check runs again).
pub struct Registry<B: StorageBackend + ?Sized> {
    pipeline: CommandPipeline<B>,
}

impl<B: StorageBackend + ?Sized + 'static> Registry<B> {
    /// Builds a registry with every built-in applier installed (§4.E).
    pub async fn new(tenant_id: impl Into<String>, backend: Arc<B>) -> EngineResult<Self> {
        Self::with_appliers(tenant_id, backend, Arc::new(ApplierRegistry::with_builtins()), PipelineConfig::default()).await
    }

    /// Builds a registry with caller-supplied appliers, e.g. to register
    /// additional event-type tags beyond the built-in eight.
    pub async fn with_appliers(
        tenant_id: impl Into<String>,
        backend: Arc<B>,
        appliers: Arc<ApplierRegistry<B>>,
        config: PipelineConfig,
    ) -> EngineResult<Self> {
        let pipeline = CommandPipeline::new(tenant_id, backend, appliers, config).await?;
        Ok(Self { pipeline })
    }

    pub fn tenant_id(&self) -> &str {
        self.pipeline.tenant_id()
    }

    /// Submits a form and returns the resulting entity snapshot, if any
    /// survives the command (§4.F).
    pub async fn submit(&self, event: FormSubmission) -> EngineResult<Option<EntitySnapshot>> {
        self.pipeline.submit(event).await
    }

    pub async fn get(&self, guid: &str) -> EngineResult<Option<EntityPair>> {
        self.pipeline
            .entity_store()
            .get(self.tenant_id(), guid)
            .await
            .map_err(|e| registry_core::EngineError::Storage(e.to_string()))
    }

    pub async fn get_by_external_id(&self, external_id: &str) -> EngineResult<Option<EntityPair>> {
        self.pipeline
            .entity_store()
            .get_by_external_id(self.tenant_id(), external_id)
            .await
            .map_err(|e| registry_core::EngineError::Storage(e.to_string()))
    }

    pub async fn search(&self, criteria: &SearchCriteria) -> EngineResult<Vec<EntityPair>> {
        self.pipeline
            .entity_store()
            .search(self.tenant_id(), criteria)
            .await
            .map_err(|e| registry_core::EngineError::Storage(e.to_string()))
    }

    pub async fn modified_since(&self, t: DateTime<Utc>) -> EngineResult<Vec<EntityPair>> {
        self.pipeline
            .entity_store()
            .modified_since(self.tenant_id(), t)
            .await
            .map_err(|e| registry_core::EngineError::Storage(e.to_string()))
    }

    pub async fn list_duplicates(&self) -> EngineResult<Vec<DuplicatePair>> {
        self.pipeline
            .entity_store()
            .list_duplicates(self.tenant_id())
            .await
            .map_err(|e| registry_core::EngineError::Storage(e.to_string()))
    }

    /// Events in log order with `timestamp > t` (§4.A), the shape the
    /// sync engine pulls from when pushing upstream.
    pub async fn events_since(&self, t: DateTime<Utc>) -> EngineResult<Vec<FormSubmission>> {
        self.pipeline
            .event_log()
            .since(self.tenant_id(), t)
            .await
            .map_err(|e| registry_core::EngineError::Storage(e.to_string()))
    }

    pub async fn audit_since(&self, t: DateTime<Utc>) -> EngineResult<Vec<AuditEntry>> {
        self.pipeline
            .audit_log()
            .since(self.tenant_id(), t)
            .await
            .map_err(|e| registry_core::EngineError::Storage(e.to_string()))
    }

    pub async fn audit_for_entity(&self, entity_guid: &str) -> EngineResult<Vec<AuditEntry>> {
        self.pipeline
            .audit_log()
            .by_entity(self.tenant_id(), entity_guid)
            .await
            .map_err(|e| registry_core::EngineError::Storage(e.to_string()))
    }

    /// Current Merkle root over the full event log (§4.B).
    pub async fn merkle_root(&self) -> String {
        self.pipeline.root().await
    }

    pub async fn merkle_proof(&self, event: &FormSubmission) -> MerkleProof {
        self.pipeline.proof(event).await
    }

    pub async fn merkle_verify(&self, event: &FormSubmission, proof: &MerkleProof) -> bool {
        self.pipeline.verify(event, proof).await
    }

    pub async fn sync_timestamp(&self, kind: SyncTimestampKind) -> EngineResult<Option<DateTime<Utc>>> {
        self.pipeline.sync_timestamp(kind).await
    }

    pub async fn set_sync_timestamp(&self, kind: SyncTimestampKind, value: DateTime<Utc>) -> EngineResult<()> {
        self.pipeline.set_sync_timestamp(kind, value).await
    }

    /// Exposes the underlying pipeline for crates (the sync engine) that
    /// need lower-level access than the façade's convenience methods.
    pub fn pipeline(&self) -> &CommandPipeline<B> {
        &self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_persist::{MemoryBackend, Predicate};
    use serde_json::json;

    #[tokio::test]
    async fn facade_submit_and_get() {
        let registry = Registry::new("tenant-1", Arc::new(MemoryBackend::new())).await.unwrap();
        registry
            .submit(FormSubmission::new("e1", "g1", "create-individual", json!({"name": "Ann"}), "u1"))
            .await
            .unwrap();

        let pair = registry.get("g1").await.unwrap().unwrap();
        assert_eq!(pair.modified.data["name"], json!("Ann"));
        assert_ne!(registry.merkle_root().await, "");
    }

    #[tokio::test]
    async fn facade_search_by_field() {
        let registry = Registry::new("tenant-1", Arc::new(MemoryBackend::new())).await.unwrap();
        registry
            .submit(FormSubmission::new("e1", "g1", "create-individual", json!({"name": "Ann"}), "u1"))
            .await
            .unwrap();

        let criteria = SearchCriteria::new().with("name", Predicate::Eq(json!("Ann")));
        let results = registry.search(&criteria).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn facade_audit_trail_for_entity() {
        let registry = Registry::new("tenant-1", Arc::new(MemoryBackend::new())).await.unwrap();
        registry
            .submit(FormSubmission::new("e1", "g1", "create-individual", json!({"name": "Ann"}), "u1"))
            .await
            .unwrap();
        registry
            .submit(FormSubmission::new("e2", "g1", "update-individual", json!({"age": 30}), "u1"))
            .await
            .unwrap();

        let entries = registry.audit_for_entity("g1").await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn startup_reopens_existing_tenant_state() {
        let backend = Arc::new(MemoryBackend::new());
        {
            let registry = Registry::new("tenant-1", backend.clone()).await.unwrap();
            registry
                .submit(FormSubmission::new("e1", "g1", "create-individual", json!({"name": "Ann"}), "u1"))
                .await
                .unwrap();
        }

        let reopened = Registry::new("tenant-1", backend).await.unwrap();
        assert!(reopened.get("g1").await.unwrap().is_some());
        assert_ne!(reopened.merkle_root().await, "");
    }
}
