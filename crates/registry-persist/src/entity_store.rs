//! Materialized entity state and the duplicate-pair set (§4.C, §4.I).

use chrono::{DateTime, Utc};
use registry_core::{DuplicatePair, EntityPair, EntitySnapshot};
use serde_json::Value;
use std::sync::Arc;

use crate::backend::{StorageBackend, StorageError, StorageExt};

/// A single-key predicate in a search conjunction (§4.C).
#[derive(Debug, Clone)]
pub enum Predicate {
    Eq(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Regex(String),
}

/// A conjunction of dot-path predicates evaluated against an entity's
/// payload (§4.C).
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria(pub Vec<(String, Predicate)>);

impl SearchCriteria {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with(mut self, path: impl Into<String>, predicate: Predicate) -> Self {
        self.0.push((path.into(), predicate));
        self
    }

    fn matches(&self, data: &Value) -> bool {
        self.0.iter().all(|(path, predicate)| {
            let Some(field) = registry_core::get_path(data, path) else {
                return false;
            };
            match predicate {
                Predicate::Eq(v) => field == v,
                Predicate::Gt(v) => compare(field, v) == Some(std::cmp::Ordering::Greater),
                Predicate::Gte(v) => matches!(
                    compare(field, v),
                    Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
                ),
                Predicate::Lt(v) => compare(field, v) == Some(std::cmp::Ordering::Less),
                Predicate::Lte(v) => matches!(
                    compare(field, v),
                    Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
                ),
                Predicate::Regex(pattern) => {
                    let Some(s) = field.as_str() else { return false };
                    regex::Regex::new(pattern).map(|re| re.is_match(s)).unwrap_or(false)
                }
            }
        })
    }
}

fn compare(field: &Value, target: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (field.as_f64(), target.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (field.as_str(), target.as_str()) {
        return Some(a.cmp(b));
    }
    None
}

/// Tenant-scoped materialized entity state plus the duplicate-pair set.
#[derive(Debug)]
pub struct EntityStore<B: StorageBackend + ?Sized> {
    backend: Arc<B>,
    prefix: String,
}

impl<B: StorageBackend + ?Sized> EntityStore<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            prefix: "entities:".to_string(),
        }
    }

    fn pair_key(&self, tenant_id: &str, guid: &str) -> String {
        format!("{}tenant:{}:pair:{}", self.prefix, tenant_id, guid)
    }

    fn external_key(&self, tenant_id: &str, external_id: &str) -> String {
        format!("{}tenant:{}:external:{}", self.prefix, tenant_id, external_id)
    }

    fn index_key(&self, tenant_id: &str) -> String {
        format!("{}tenant:{}:index", self.prefix, tenant_id)
    }

    fn duplicates_key(&self, tenant_id: &str) -> String {
        format!("{}tenant:{}:duplicates", self.prefix, tenant_id)
    }

    async fn index(&self, tenant_id: &str) -> Result<Vec<String>, StorageError> {
        Ok(self.backend.get(&self.index_key(tenant_id)).await?.unwrap_or_default())
    }

    /// Upserts the `{initial, modified}` pair for `modified.guid` (§4.C).
    pub async fn save(
        &self,
        tenant_id: &str,
        initial: EntitySnapshot,
        modified: EntitySnapshot,
    ) -> Result<(), StorageError> {
        let guid = modified.guid.clone();
        let external_id = modified.external_id.clone();
        let pair = EntityPair { initial, modified };

        let is_new = !self.backend.exists(&self.pair_key(tenant_id, &guid)).await?;
        self.backend.set(&self.pair_key(tenant_id, &guid), &pair).await?;

        if is_new {
            let mut index = self.index(tenant_id).await?;
            index.push(guid.clone());
            self.backend.set(&self.index_key(tenant_id), &index).await?;
        }

        if let Some(eid) = external_id {
            self.backend.set(&self.external_key(tenant_id, &eid), &guid).await?;
        }

        Ok(())
    }

    pub async fn get(&self, tenant_id: &str, guid: &str) -> Result<Option<EntityPair>, StorageError> {
        self.backend.get(&self.pair_key(tenant_id, guid)).await
    }

    pub async fn get_by_external_id(
        &self,
        tenant_id: &str,
        external_id: &str,
    ) -> Result<Option<EntityPair>, StorageError> {
        let Some(guid): Option<String> = self.backend.get(&self.external_key(tenant_id, external_id)).await? else {
            return Ok(None);
        };
        self.get(tenant_id, &guid).await
    }

    pub async fn all(&self, tenant_id: &str) -> Result<Vec<EntityPair>, StorageError> {
        let mut out = Vec::new();
        for guid in self.index(tenant_id).await? {
            if let Some(pair) = self.get(tenant_id, &guid).await? {
                out.push(pair);
            }
        }
        Ok(out)
    }

    /// Conjunction of dot-path predicates evaluated against each entity's
    /// current (`modified`) payload (§4.C).
    pub async fn search(&self, tenant_id: &str, criteria: &SearchCriteria) -> Result<Vec<EntityPair>, StorageError> {
        Ok(self
            .all(tenant_id)
            .await?
            .into_iter()
            .filter(|pair| criteria.matches(&pair.modified.data))
            .collect())
    }

    pub async fn modified_since(&self, tenant_id: &str, t: DateTime<Utc>) -> Result<Vec<EntityPair>, StorageError> {
        Ok(self
            .all(tenant_id)
            .await?
            .into_iter()
            .filter(|pair| pair.modified.last_updated > t)
            .collect())
    }

    /// Copies `modified` into `initial` (§4.C).
    pub async fn mark_synced(&self, tenant_id: &str, guid: &str) -> Result<(), StorageError> {
        if let Some(mut pair) = self.get(tenant_id, guid).await? {
            pair.mark_synced();
            self.backend.set(&self.pair_key(tenant_id, guid), &pair).await?;
        }
        Ok(())
    }

    /// Removes the entity from state (events that referenced it survive,
    /// §3 lifecycle).
    pub async fn delete(&self, tenant_id: &str, guid: &str) -> Result<bool, StorageError> {
        let removed = self.backend.delete(&self.pair_key(tenant_id, guid)).await?;
        if removed {
            let mut index = self.index(tenant_id).await?;
            index.retain(|g| g != guid);
            self.backend.set(&self.index_key(tenant_id), &index).await?;
        }
        Ok(removed)
    }

    pub async fn clear(&self, tenant_id: &str) -> Result<(), StorageError> {
        for guid in self.index(tenant_id).await? {
            self.backend.delete(&self.pair_key(tenant_id, &guid)).await?;
        }
        self.backend.delete(&self.index_key(tenant_id)).await?;
        self.backend.delete(&self.duplicates_key(tenant_id)).await?;
        Ok(())
    }

    pub async fn save_duplicate(&self, tenant_id: &str, pair: DuplicatePair) -> Result<(), StorageError> {
        let mut pairs = self.list_duplicates(tenant_id).await?;
        if !pairs.iter().any(|p| p.involves(&pair.entity_guid, &pair.duplicate_guid)) {
            pairs.push(pair);
            self.backend.set(&self.duplicates_key(tenant_id), &pairs).await?;
        }
        Ok(())
    }

    pub async fn list_duplicates(&self, tenant_id: &str) -> Result<Vec<DuplicatePair>, StorageError> {
        Ok(self.backend.get(&self.duplicates_key(tenant_id)).await?.unwrap_or_default())
    }

    /// Removes the pair naming both GUIDs, in either order (§4.I).
    pub async fn resolve_duplicate(
        &self,
        tenant_id: &str,
        entity_guid: &str,
        duplicate_guid: &str,
    ) -> Result<(), StorageError> {
        let mut pairs = self.list_duplicates(tenant_id).await?;
        pairs.retain(|p| !p.involves(entity_guid, duplicate_guid));
        self.backend.set(&self.duplicates_key(tenant_id), &pairs).await?;
        Ok(())
    }
}
