//! The Command Pipeline (§4.F): the single entry point for mutation.
//! Accepts a submission, detects duplicates, dispatches to the applier
//! registry, persists the event and resulting state, and appends an
//! audit entry.

use std::sync::Arc;

use futures::future::BoxFuture;
use registry_core::{
    AuditEntry, DuplicatePair, EngineError, EngineResult, EntitySnapshot, FormSubmission, MerkleProof, MerkleTree,
};
use registry_persist::{AuditLog, EntityStore, EventLog, Predicate, SearchCriteria, StorageBackend, StorageError, SyncTimestampKind};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::applier::{ApplierContext, ApplierRegistry, StateOp};

/// Runtime-tunable pipeline parameters (§9 Open Question: duplicate match
/// fields default to `["name"]`).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub duplicate_match_fields: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            duplicate_match_fields: vec!["name".to_string()],
        }
    }
}

fn storage_err(e: StorageError) -> EngineError {
    EngineError::Storage(e.to_string())
}

/// Wires the Applier Registry to the Event Log, Entity State Store, and
/// Audit Log for one tenant.
pub struct CommandPipeline<B: StorageBackend + ?Sized> {
    tenant_id: String,
    event_log: EventLog<B>,
    entity_store: EntityStore<B>,
    audit_log: AuditLog<B>,
    appliers: Arc<ApplierRegistry<B>>,
    merkle: RwLock<MerkleTree>,
    config: PipelineConfig,
}

impl<B: StorageBackend + ?Sized + 'static> CommandPipeline<B> {
    /// Rebuilds the Merkle index from the persisted log and checks it
    /// against the stored root, logging a warning and adopting the
    /// recomputed root on mismatch (§4.B persistence, §7 startup
    /// behaviour for `Integrity`).
    pub async fn new(
        tenant_id: impl Into<String>,
        backend: Arc<B>,
        appliers: Arc<ApplierRegistry<B>>,
        config: PipelineConfig,
    ) -> EngineResult<Self> {
        let tenant_id = tenant_id.into();
        let event_log = EventLog::new(backend.clone());
        let entity_store = EntityStore::new(backend.clone());
        let audit_log = AuditLog::new(backend);

        let events = event_log.all(&tenant_id).await.map_err(storage_err)?;
        let tree = MerkleTree::rebuild(&events);
        let fresh_root = tree.root();

        if let Some(persisted) = event_log.get_persisted_root(&tenant_id).await.map_err(storage_err)? {
            if persisted != fresh_root {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    persisted_root = %persisted,
                    recomputed_root = %fresh_root,
                    "merkle root mismatch on startup; adopting recomputed root"
                );
            }
        }
        event_log.set_persisted_root(&tenant_id, &fresh_root).await.map_err(storage_err)?;

        Ok(Self {
            tenant_id,
            event_log,
            entity_store,
            audit_log,
            appliers,
            merkle: RwLock::new(tree),
            config,
        })
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn event_log(&self) -> &EventLog<B> {
        &self.event_log
    }

    pub fn entity_store(&self) -> &EntityStore<B> {
        &self.entity_store
    }

    pub fn audit_log(&self) -> &AuditLog<B> {
        &self.audit_log
    }

    /// Synchronous in the source's sense of "non-blocking" (§5): this
    /// await only ever contends on an uncontended in-process lock, never
    /// on I/O.
    pub async fn root(&self) -> String {
        self.merkle.read().await.root()
    }

    pub async fn proof(&self, event: &FormSubmission) -> MerkleProof {
        self.merkle.read().await.proof(event)
    }

    pub async fn verify(&self, event: &FormSubmission, proof: &MerkleProof) -> bool {
        self.merkle.read().await.verify(event, proof)
    }

    /// `submit(event) -> entity?` (§4.F).
    pub async fn submit(&self, event: FormSubmission) -> EngineResult<Option<EntitySnapshot>> {
        self.submit_inner(event, true).await
    }

    /// `top_level` distinguishes a real submission (persisted to the
    /// event log, bumps the Merkle root) from a nested follow-up an
    /// applier produced, which only writes state and an audit entry
    /// (§9 design note; see `S3` in the testable-properties table: a
    /// `create-group` with two new members logs one event but three
    /// state-store entities).
    fn submit_inner<'a>(&'a self, event: FormSubmission, top_level: bool) -> BoxFuture<'a, EngineResult<Option<EntitySnapshot>>> {
        Box::pin(async move {
            if top_level && self.event_log.exists(&self.tenant_id, &event.guid).await.map_err(storage_err)? {
                let existing = self
                    .entity_store
                    .get(&self.tenant_id, &event.entity_guid)
                    .await
                    .map_err(storage_err)?;
                return Ok(existing.map(|pair| pair.modified));
            }

            let applier = self.appliers.get(&event.event_type)?;
            let existing_pair = self
                .entity_store
                .get(&self.tenant_id, &event.entity_guid)
                .await
                .map_err(storage_err)?;

            if existing_pair.is_none() {
                self.flag_duplicates(&event).await?;
            }

            let ctx = ApplierContext::new(&self.entity_store, &self.tenant_id);
            let output = applier.apply(&ctx, &event, existing_pair.as_ref()).await?;

            for op in &output.ops {
                self.apply_op(op).await?;
            }

            let prev_root = self.root().await;

            if top_level {
                self.event_log.append(&self.tenant_id, &event).await.map_err(|e| match e {
                    StorageError::AlreadyExists(guid) => EngineError::Conflict(guid),
                    other => storage_err(other),
                })?;
                self.rebuild_merkle().await.map_err(storage_err)?;
            }

            let entry = AuditEntry::new(
                Uuid::new_v4().to_string(),
                &event.user_id,
                &event.event_type,
                &event,
                event.payload.clone(),
                &prev_root,
            );
            self.audit_log.append(&self.tenant_id, &entry).await.map_err(storage_err)?;

            for followup in output.followups {
                self.submit_inner(followup, false).await?;
            }

            if top_level {
                let final_entity = self
                    .entity_store
                    .get(&self.tenant_id, &event.entity_guid)
                    .await
                    .map_err(storage_err)?
                    .map(|pair| pair.modified);
                Ok(final_entity.or(output.entity))
            } else {
                Ok(output.entity)
            }
        })
    }

    /// Creation-only duplicate detection (§4.F step 4, §9 Open Question):
    /// runs a backend search over `duplicate_match_fields` and flags any
    /// exact match found among existing entities.
    async fn flag_duplicates(&self, event: &FormSubmission) -> EngineResult<()> {
        let mut criteria = SearchCriteria::new();
        for field in &self.config.duplicate_match_fields {
            if let Some(value) = registry_core::get_path(&event.payload, field) {
                criteria = criteria.with(field.clone(), Predicate::Eq(value.clone()));
            }
        }
        if criteria.0.is_empty() {
            return Ok(());
        }

        let matches = self.entity_store.search(&self.tenant_id, &criteria).await.map_err(storage_err)?;
        for candidate in matches {
            if candidate.modified.guid != event.entity_guid {
                self.entity_store
                    .save_duplicate(
                        &self.tenant_id,
                        DuplicatePair::new(event.entity_guid.clone(), candidate.modified.guid.clone()),
                    )
                    .await
                    .map_err(storage_err)?;
            }
        }
        Ok(())
    }

    async fn apply_op(&self, op: &StateOp) -> EngineResult<()> {
        match op {
            StateOp::Save(snapshot) => {
                let existing = self
                    .entity_store
                    .get(&self.tenant_id, &snapshot.guid)
                    .await
                    .map_err(storage_err)?;
                let initial = existing.map(|pair| pair.initial).unwrap_or_else(|| snapshot.clone());
                self.entity_store
                    .save(&self.tenant_id, initial, snapshot.clone())
                    .await
                    .map_err(storage_err)
            }
            StateOp::Delete(guid) => self.entity_store.delete(&self.tenant_id, guid).await.map(|_| ()).map_err(storage_err),
            StateOp::FlagDuplicate(pair) => self
                .entity_store
                .save_duplicate(&self.tenant_id, pair.clone())
                .await
                .map_err(storage_err),
            StateOp::ResolveDuplicate {
                entity_guid,
                duplicate_guid,
                also_delete,
            } => {
                self.entity_store
                    .resolve_duplicate(&self.tenant_id, entity_guid, duplicate_guid)
                    .await
                    .map_err(storage_err)?;
                if *also_delete {
                    self.entity_store.delete(&self.tenant_id, duplicate_guid).await.map_err(storage_err)?;
                }
                Ok(())
            }
        }
    }

    async fn rebuild_merkle(&self) -> Result<(), StorageError> {
        let events = self.event_log.all(&self.tenant_id).await?;
        let tree = MerkleTree::rebuild(&events);
        let root = tree.root();
        *self.merkle.write().await = tree;
        self.event_log.set_persisted_root(&self.tenant_id, &root).await
    }

    /// `last_local_sync` etc. (§4.A) — exposed so the sync engine doesn't
    /// need its own handle on the event log.
    pub async fn sync_timestamp(&self, kind: SyncTimestampKind) -> EngineResult<Option<chrono::DateTime<chrono::Utc>>> {
        self.event_log.get_sync_timestamp(&self.tenant_id, kind).await.map_err(storage_err)
    }

    pub async fn set_sync_timestamp(&self, kind: SyncTimestampKind, value: chrono::DateTime<chrono::Utc>) -> EngineResult<()> {
        self.event_log.set_sync_timestamp(&self.tenant_id, kind, value).await.map_err(storage_err)
    }
}
