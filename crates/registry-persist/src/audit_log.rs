//! Audit trail storage, stored alongside the event log (§4.D).

use chrono::{DateTime, Utc};
use registry_core::{AuditEntry, SyncLevel};
use std::sync::Arc;

use crate::backend::{StorageBackend, StorageError, StorageExt};

/// Tenant-scoped audit log.
#[derive(Debug)]
pub struct AuditLog<B: StorageBackend + ?Sized> {
    backend: Arc<B>,
    prefix: String,
}

impl<B: StorageBackend + ?Sized> AuditLog<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            prefix: "audit:".to_string(),
        }
    }

    fn entry_key(&self, tenant_id: &str, guid: &str) -> String {
        format!("{}tenant:{}:entry:{}", self.prefix, tenant_id, guid)
    }

    fn index_key(&self, tenant_id: &str) -> String {
        format!("{}tenant:{}:index", self.prefix, tenant_id)
    }

    async fn index(&self, tenant_id: &str) -> Result<Vec<String>, StorageError> {
        Ok(self.backend.get(&self.index_key(tenant_id)).await?.unwrap_or_default())
    }

    pub async fn append(&self, tenant_id: &str, entry: &AuditEntry) -> Result<(), StorageError> {
        self.backend.set(&self.entry_key(tenant_id, &entry.guid), entry).await?;
        let mut index = self.index(tenant_id).await?;
        index.push(entry.guid.clone());
        self.backend.set(&self.index_key(tenant_id), &index).await?;
        Ok(())
    }

    pub async fn append_many(&self, tenant_id: &str, entries: &[AuditEntry]) -> Result<(), StorageError> {
        for entry in entries {
            self.append(tenant_id, entry).await?;
        }
        Ok(())
    }

    pub async fn get(&self, tenant_id: &str, guid: &str) -> Result<Option<AuditEntry>, StorageError> {
        self.backend.get(&self.entry_key(tenant_id, guid)).await
    }

    /// Promotes each referenced entry's sync-level to the max of its
    /// current level and the level carried on the input, mirroring the
    /// event log's own promotion (§4.D, never a downgrade).
    pub async fn promote_sync_level(&self, tenant_id: &str, entries: &[AuditEntry]) -> Result<(), StorageError> {
        for carried in entries {
            if let Some(mut stored) = self.get(tenant_id, &carried.guid).await? {
                stored.sync_level = stored.sync_level.promoted(carried.sync_level);
                self.backend.set(&self.entry_key(tenant_id, &stored.guid), &stored).await?;
            }
        }
        Ok(())
    }

    async fn all_ordered(&self, tenant_id: &str) -> Result<Vec<AuditEntry>, StorageError> {
        let mut entries = Vec::new();
        for guid in self.index(tenant_id).await? {
            if let Some(entry) = self.backend.get(&self.entry_key(tenant_id, &guid)).await? {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|e: &AuditEntry| e.timestamp);
        Ok(entries)
    }

    pub async fn since(&self, tenant_id: &str, t: DateTime<Utc>) -> Result<Vec<AuditEntry>, StorageError> {
        Ok(self
            .all_ordered(tenant_id)
            .await?
            .into_iter()
            .filter(|e| e.timestamp > t)
            .collect())
    }

    /// Chronological entries referencing `entity_guid` (§4.D).
    pub async fn by_entity(&self, tenant_id: &str, entity_guid: &str) -> Result<Vec<AuditEntry>, StorageError> {
        Ok(self
            .all_ordered(tenant_id)
            .await?
            .into_iter()
            .filter(|e| e.entity_guid == entity_guid)
            .collect())
    }

    /// One JSON object per line, in chronological order.
    pub async fn to_jsonl(&self, tenant_id: &str) -> Result<String, StorageError> {
        let entries = self.all_ordered(tenant_id).await?;
        let lines: Result<Vec<String>, _> = entries.iter().map(serde_json::to_string).collect();
        lines
            .map(|lines| lines.join("\n"))
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use registry_core::FormSubmission;
    use serde_json::json;

    fn entry(guid: &str, entity_guid: &str) -> AuditEntry {
        let event = FormSubmission::new("e1", entity_guid, "create-individual", json!({}), "u1");
        AuditEntry::new(guid, "u1", "create-individual", &event, json!({}), "")
    }

    #[tokio::test]
    async fn append_and_by_entity() {
        let log = AuditLog::new(Arc::new(MemoryBackend::new()));
        log.append("t1", &entry("a1", "ent-1")).await.unwrap();
        log.append("t1", &entry("a2", "ent-2")).await.unwrap();

        let for_ent1 = log.by_entity("t1", "ent-1").await.unwrap();
        assert_eq!(for_ent1.len(), 1);
        assert_eq!(for_ent1[0].guid, "a1");
    }

    #[tokio::test]
    async fn to_jsonl_has_one_line_per_entry() {
        let log = AuditLog::new(Arc::new(MemoryBackend::new()));
        log.append("t1", &entry("a1", "ent-1")).await.unwrap();
        log.append("t1", &entry("a2", "ent-2")).await.unwrap();
        let jsonl = log.to_jsonl("t1").await.unwrap();
        assert_eq!(jsonl.lines().count(), 2);
    }

    #[tokio::test]
    async fn promote_sync_level_never_downgrades() {
        let log = AuditLog::new(Arc::new(MemoryBackend::new()));
        let mut e = entry("a1", "ent-1");
        e.sync_level = SyncLevel::Remote;
        log.append("t1", &e).await.unwrap();

        let mut downgrade = e.clone();
        downgrade.sync_level = SyncLevel::Local;
        log.promote_sync_level("t1", std::slice::from_ref(&downgrade)).await.unwrap();

        let stored = log.get("t1", "a1").await.unwrap().unwrap();
        assert_eq!(stored.sync_level, SyncLevel::Remote);
    }
}
