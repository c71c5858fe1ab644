//! The Applier Registry (§4.E): maps an event-type tag to a transformation
//! from `(entity, event)` to a new entity, plus whatever side-effect
//! writes and nested sub-commands the transformation implies.
//!
//! §9's design note replaces the source's `save_entity` closure with a
//! flat data shape: an applier returns the writes it wants (`StateOp`)
//! and any nested events it wants the Command Pipeline to process on its
//! behalf (`followups`), rather than calling back into the pipeline
//! itself. This keeps appliers pure and the call graph a single
//! recursion in the pipeline, not mutual recursion through a closure.

use std::collections::HashMap;

use async_trait::async_trait;
use registry_core::{DuplicatePair, EngineError, EngineResult, EntityKind, EntityPair, EntitySnapshot, FormSubmission};
use registry_persist::{EntityStore, StorageBackend, StorageError};
use serde_json::Value;

/// A single write an applier wants committed against the entity store.
/// The Command Pipeline executes these after the applier returns
/// successfully (§4.F step 5/6).
#[derive(Debug, Clone)]
pub enum StateOp {
    /// Upserts `snapshot`. The pipeline resolves whether this is a fresh
    /// creation or an edit of an existing pair and preserves `initial`
    /// accordingly (§4.C `save`).
    Save(EntitySnapshot),
    /// Removes the entity snapshot; the originating event still survives
    /// in the log (§3 lifecycle).
    Delete(String),
    FlagDuplicate(DuplicatePair),
    ResolveDuplicate {
        entity_guid: String,
        duplicate_guid: String,
        also_delete: bool,
    },
}

/// What an applier produces for a single event.
#[derive(Debug, Clone, Default)]
pub struct ApplierOutput {
    /// The primary entity this event touched, if any survives the call.
    pub entity: Option<EntitySnapshot>,
    pub ops: Vec<StateOp>,
    /// Nested commands the pipeline re-enters itself for (§4.F step 5).
    pub followups: Vec<FormSubmission>,
}

impl ApplierOutput {
    pub fn new(entity: EntitySnapshot, ops: Vec<StateOp>) -> Self {
        Self {
            entity: Some(entity),
            ops,
            followups: Vec::new(),
        }
    }

    pub fn with_followups(mut self, followups: Vec<FormSubmission>) -> Self {
        self.followups = followups;
        self
    }
}

/// Read-only access to current entity state, handed to an applier so it
/// can check whether a referenced GUID already exists (e.g. `add-member`
/// deciding whether to nest a creation).
pub struct ApplierContext<'a, B: StorageBackend + ?Sized> {
    entity_store: &'a EntityStore<B>,
    tenant_id: &'a str,
}

impl<'a, B: StorageBackend + ?Sized> ApplierContext<'a, B> {
    pub fn new(entity_store: &'a EntityStore<B>, tenant_id: &'a str) -> Self {
        Self { entity_store, tenant_id }
    }

    pub async fn get_entity(&self, guid: &str) -> EngineResult<Option<EntityPair>> {
        self.entity_store.get(self.tenant_id, guid).await.map_err(storage_err)
    }
}

fn storage_err(e: StorageError) -> EngineError {
    EngineError::Storage(e.to_string())
}

/// A pure transformation from `(entity, event)` to a new entity (§4.E).
#[async_trait]
pub trait Applier<B: StorageBackend + ?Sized>: Send + Sync {
    async fn apply(
        &self,
        ctx: &ApplierContext<'_, B>,
        event: &FormSubmission,
        existing: Option<&EntityPair>,
    ) -> EngineResult<ApplierOutput>;
}

/// Maps event-type tag to [`Applier`] (§4.E).
pub struct ApplierRegistry<B: StorageBackend + ?Sized> {
    appliers: HashMap<String, Box<dyn Applier<B>>>,
}

impl<B: StorageBackend + ?Sized + 'static> ApplierRegistry<B> {
    pub fn new() -> Self {
        Self { appliers: HashMap::new() }
    }

    /// A registry with every built-in applier from the §4.E table
    /// installed. User code registers additional tags with [`register`].
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("create-individual", CreateIndividualApplier);
        registry.register("create-group", CreateGroupApplier);
        registry.register("update-individual", UpdateIndividualApplier);
        registry.register("update-group", UpdateGroupApplier);
        registry.register("add-member", AddMemberApplier);
        registry.register("remove-member", RemoveMemberApplier);
        registry.register("delete-entity", DeleteEntityApplier);
        registry.register("resolve-duplicate", ResolveDuplicateApplier);
        registry
    }

    pub fn register(&mut self, event_type: impl Into<String>, applier: impl Applier<B> + 'static) {
        self.appliers.insert(event_type.into(), Box::new(applier));
    }

    pub fn get(&self, event_type: &str) -> EngineResult<&(dyn Applier<B> + 'static)> {
        self.appliers
            .get(event_type)
            .map(|a| a.as_ref())
            .ok_or_else(|| EngineError::UnknownEventType(event_type.to_string()))
    }
}

impl<B: StorageBackend + ?Sized + 'static> Default for ApplierRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// Shallow-merges `patch`'s keys into `base`, in place. Unset keys in
/// `base` are left untouched (§9 "flexible payload").
fn merge_object(base: &mut Value, patch: &Value) {
    if let (Some(base_obj), Some(patch_obj)) = (base.as_object_mut(), patch.as_object()) {
        for (key, value) in patch_obj {
            base_obj.insert(key.clone(), value.clone());
        }
    }
}

fn payload_without(payload: &Value, excluded: &str) -> Value {
    match payload.as_object() {
        Some(obj) => Value::Object(obj.iter().filter(|(k, _)| k.as_str() != excluded).map(|(k, v)| (k.clone(), v.clone())).collect()),
        None => payload.clone(),
    }
}

fn member_guid(member: &Value) -> EngineResult<String> {
    member
        .get("guid")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EngineError::validation("member entry is missing a \"guid\" field"))
}

/// `create-individual`: creates an Individual at `version = 1`. Duplicate
/// detection against existing Individuals runs generically in the
/// Command Pipeline (§4.F step 4), keyed on `duplicate_match_fields`.
pub struct CreateIndividualApplier;

#[async_trait]
impl<B: StorageBackend + ?Sized> Applier<B> for CreateIndividualApplier {
    async fn apply(
        &self,
        _ctx: &ApplierContext<'_, B>,
        event: &FormSubmission,
        existing: Option<&EntityPair>,
    ) -> EngineResult<ApplierOutput> {
        if existing.is_some() {
            return Err(EngineError::InvalidOperation(format!(
                "entity {} already exists",
                event.entity_guid
            )));
        }
        let snapshot = EntitySnapshot::new_individual(event.entity_guid.clone(), event.entity_guid.clone(), event.payload.clone());
        Ok(ApplierOutput::new(snapshot.clone(), vec![StateOp::Save(snapshot)]))
    }
}

/// `create-group`: creates a Group at `version = 1` with `member_ids`
/// populated directly from a `members[]` array in the payload, if
/// present. Each member also gets a `create-individual` followup so its
/// own entity exists; the group itself stays at version 1 since its
/// member list is part of the creation snapshot, not a later mutation.
pub struct CreateGroupApplier;

#[async_trait]
impl<B: StorageBackend + ?Sized> Applier<B> for CreateGroupApplier {
    async fn apply(
        &self,
        _ctx: &ApplierContext<'_, B>,
        event: &FormSubmission,
        existing: Option<&EntityPair>,
    ) -> EngineResult<ApplierOutput> {
        if existing.is_some() {
            return Err(EngineError::InvalidOperation(format!(
                "entity {} already exists",
                event.entity_guid
            )));
        }
        let data = payload_without(&event.payload, "members");
        let mut snapshot = EntitySnapshot::new_group(event.entity_guid.clone(), event.entity_guid.clone(), data);

        let mut followups = Vec::new();
        if let Some(members) = event.payload.get("members").and_then(Value::as_array) {
            for member in members {
                let guid = member_guid(member)?;
                let member_payload = payload_without(member, "guid");
                followups.push(FormSubmission::new(
                    format!("{}-create-{}", event.guid, guid),
                    guid.clone(),
                    "create-individual",
                    member_payload,
                    event.user_id.clone(),
                ));
                snapshot.add_member(guid);
            }
        }

        Ok(ApplierOutput::new(snapshot.clone(), vec![StateOp::Save(snapshot)]).with_followups(followups))
    }
}

/// `update-individual`: merges the payload into the entity's data and
/// bumps the version.
pub struct UpdateIndividualApplier;

#[async_trait]
impl<B: StorageBackend + ?Sized> Applier<B> for UpdateIndividualApplier {
    async fn apply(
        &self,
        _ctx: &ApplierContext<'_, B>,
        event: &FormSubmission,
        existing: Option<&EntityPair>,
    ) -> EngineResult<ApplierOutput> {
        let pair = existing.ok_or_else(|| EngineError::NotFound(event.entity_guid.clone()))?;
        if pair.modified.kind != EntityKind::Individual {
            return Err(EngineError::InvalidOperation(format!("{} is not an Individual", event.entity_guid)));
        }
        let mut snapshot = pair.modified.clone();
        merge_object(&mut snapshot.data, &event.payload);
        snapshot.bump_version();
        Ok(ApplierOutput::new(snapshot.clone(), vec![StateOp::Save(snapshot)]))
    }
}

/// `update-group`: merges the payload into the entity's data and bumps
/// the version; a `member_ids` array in the payload replaces the list
/// verbatim.
pub struct UpdateGroupApplier;

#[async_trait]
impl<B: StorageBackend + ?Sized> Applier<B> for UpdateGroupApplier {
    async fn apply(
        &self,
        _ctx: &ApplierContext<'_, B>,
        event: &FormSubmission,
        existing: Option<&EntityPair>,
    ) -> EngineResult<ApplierOutput> {
        let pair = existing.ok_or_else(|| EngineError::NotFound(event.entity_guid.clone()))?;
        if pair.modified.kind != EntityKind::Group {
            return Err(EngineError::InvalidOperation(format!("{} is not a Group", event.entity_guid)));
        }
        let mut snapshot = pair.modified.clone();
        let data_patch = payload_without(&event.payload, "member_ids");
        merge_object(&mut snapshot.data, &data_patch);
        if let Some(ids) = event.payload.get("member_ids").and_then(Value::as_array) {
            snapshot.member_ids = ids.iter().filter_map(Value::as_str).map(str::to_string).collect();
        }
        snapshot.bump_version();
        Ok(ApplierOutput::new(snapshot.clone(), vec![StateOp::Save(snapshot)]))
    }
}

/// `add-member`: appends each `{guid, ...}` in `payload.members` to
/// `member_ids`. A member whose GUID doesn't yet exist is nested as a
/// `create-individual` followup first (§4.E table).
pub struct AddMemberApplier;

#[async_trait]
impl<B: StorageBackend + ?Sized> Applier<B> for AddMemberApplier {
    async fn apply(
        &self,
        ctx: &ApplierContext<'_, B>,
        event: &FormSubmission,
        existing: Option<&EntityPair>,
    ) -> EngineResult<ApplierOutput> {
        let pair = existing.ok_or_else(|| EngineError::NotFound(event.entity_guid.clone()))?;
        if pair.modified.kind != EntityKind::Group {
            return Err(EngineError::InvalidOperation(format!("{} is not a Group", event.entity_guid)));
        }
        let members = event
            .payload
            .get("members")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::validation("add-member payload is missing a \"members\" array"))?;

        let mut snapshot = pair.modified.clone();
        let mut followups = Vec::new();
        for member in members {
            let guid = member_guid(member)?;
            if ctx.get_entity(&guid).await?.is_none() {
                let member_payload = payload_without(member, "guid");
                followups.push(FormSubmission::new(
                    format!("{}-create-{}", event.guid, guid),
                    guid.clone(),
                    "create-individual",
                    member_payload,
                    event.user_id.clone(),
                ));
            }
            snapshot.add_member(guid);
        }
        snapshot.bump_version();
        Ok(ApplierOutput::new(snapshot.clone(), vec![StateOp::Save(snapshot)]).with_followups(followups))
    }
}

/// `remove-member`: removes `member_id` from `member_ids`. The member
/// entity itself is left untouched (§4.E table).
pub struct RemoveMemberApplier;

#[async_trait]
impl<B: StorageBackend + ?Sized> Applier<B> for RemoveMemberApplier {
    async fn apply(
        &self,
        _ctx: &ApplierContext<'_, B>,
        event: &FormSubmission,
        existing: Option<&EntityPair>,
    ) -> EngineResult<ApplierOutput> {
        let pair = existing.ok_or_else(|| EngineError::NotFound(event.entity_guid.clone()))?;
        if pair.modified.kind != EntityKind::Group {
            return Err(EngineError::InvalidOperation(format!("{} is not a Group", event.entity_guid)));
        }
        let member_id = event
            .payload
            .get("memberId")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::validation("remove-member payload is missing \"memberId\""))?;
        let mut snapshot = pair.modified.clone();
        snapshot.remove_member(member_id);
        snapshot.bump_version();
        Ok(ApplierOutput::new(snapshot.clone(), vec![StateOp::Save(snapshot)]))
    }
}

/// `delete-entity`: removes the entity snapshot from the state store.
/// The event itself remains in the log (§3 lifecycle).
pub struct DeleteEntityApplier;

#[async_trait]
impl<B: StorageBackend + ?Sized> Applier<B> for DeleteEntityApplier {
    async fn apply(
        &self,
        _ctx: &ApplierContext<'_, B>,
        event: &FormSubmission,
        existing: Option<&EntityPair>,
    ) -> EngineResult<ApplierOutput> {
        if existing.is_none() {
            return Err(EngineError::NotFound(event.entity_guid.clone()));
        }
        Ok(ApplierOutput {
            entity: None,
            ops: vec![StateOp::Delete(event.entity_guid.clone())],
            followups: Vec::new(),
        })
    }
}

/// `resolve-duplicate`: consumes `{duplicates[], shouldDelete}`, removing
/// each named pair from the duplicate set and optionally deleting the
/// duplicate entity (§4.E table, §4.I).
pub struct ResolveDuplicateApplier;

#[async_trait]
impl<B: StorageBackend + ?Sized> Applier<B> for ResolveDuplicateApplier {
    async fn apply(
        &self,
        _ctx: &ApplierContext<'_, B>,
        event: &FormSubmission,
        existing: Option<&EntityPair>,
    ) -> EngineResult<ApplierOutput> {
        let duplicates = event
            .payload
            .get("duplicates")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::validation("resolve-duplicate payload is missing \"duplicates\""))?;
        let should_delete = event.payload.get("shouldDelete").and_then(Value::as_bool).unwrap_or(false);

        let ops = duplicates
            .iter()
            .filter_map(Value::as_str)
            .map(|dup| StateOp::ResolveDuplicate {
                entity_guid: event.entity_guid.clone(),
                duplicate_guid: dup.to_string(),
                also_delete: should_delete,
            })
            .collect();

        Ok(ApplierOutput {
            entity: existing.map(|p| p.modified.clone()),
            ops,
            followups: Vec::new(),
        })
    }
}
