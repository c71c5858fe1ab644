//! Append-only event log over a [`StorageBackend`] (§4.A).

use chrono::{DateTime, Utc};
use registry_core::{FormSubmission, SyncLevel};
use std::sync::Arc;

use crate::backend::{StorageBackend, StorageError, StorageExt};

/// Outcome of [`EventLog::append_many`]: a batch is not atomic, so callers
/// need to see which GUIDs actually landed.
#[derive(Debug, Default)]
pub struct AppendManyOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, StorageError)>,
}

/// The four scalar sync timestamps tracked per tenant (§4.A, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTimestampKind {
    LastLocalSync,
    LastRemoteSync,
    LastPushExternalSync,
    LastPullExternalSync,
}

impl SyncTimestampKind {
    fn key_suffix(self) -> &'static str {
        match self {
            Self::LastLocalSync => "last_local_sync",
            Self::LastRemoteSync => "last_remote_sync",
            Self::LastPushExternalSync => "last_push_external_sync",
            Self::LastPullExternalSync => "last_pull_external_sync",
        }
    }
}

/// Tenant-scoped append-only event log.
#[derive(Debug)]
pub struct EventLog<B: StorageBackend + ?Sized> {
    backend: Arc<B>,
    prefix: String,
}

impl<B: StorageBackend + ?Sized> EventLog<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            prefix: "events:".to_string(),
        }
    }

    fn event_key(&self, tenant_id: &str, guid: &str) -> String {
        format!("{}tenant:{}:event:{}", self.prefix, tenant_id, guid)
    }

    fn index_key(&self, tenant_id: &str) -> String {
        format!("{}tenant:{}:index", self.prefix, tenant_id)
    }

    fn meta_key(&self, tenant_id: &str, kind: SyncTimestampKind) -> String {
        format!("{}tenant:{}:meta:{}", self.prefix, tenant_id, kind.key_suffix())
    }

    fn root_key(&self, tenant_id: &str) -> String {
        format!("{}tenant:{}:meta:merkle_root", self.prefix, tenant_id)
    }

    async fn index(&self, tenant_id: &str) -> Result<Vec<String>, StorageError> {
        Ok(self.backend.get(&self.index_key(tenant_id)).await?.unwrap_or_default())
    }

    /// Persists a single event. Fails with `AlreadyExists` if `event.guid`
    /// is already present (§4.A, §7 `Conflict`).
    pub async fn append(&self, tenant_id: &str, event: &FormSubmission) -> Result<String, StorageError> {
        if self.exists(tenant_id, &event.guid).await? {
            return Err(StorageError::AlreadyExists(event.guid.clone()));
        }
        self.backend.set(&self.event_key(tenant_id, &event.guid), event).await?;
        let mut index = self.index(tenant_id).await?;
        index.push(event.guid.clone());
        self.backend.set(&self.index_key(tenant_id), &index).await?;
        Ok(event.guid.clone())
    }

    /// Batch append; per-event atomicity only, the whole call never fails
    /// wholesale (§4.A).
    pub async fn append_many(&self, tenant_id: &str, events: &[FormSubmission]) -> AppendManyOutcome {
        let mut outcome = AppendManyOutcome::default();
        for event in events {
            match self.append(tenant_id, event).await {
                Ok(guid) => outcome.succeeded.push(guid),
                Err(e) => outcome.failed.push((event.guid.clone(), e)),
            }
        }
        outcome
    }

    pub async fn exists(&self, tenant_id: &str, guid: &str) -> Result<bool, StorageError> {
        self.backend.exists(&self.event_key(tenant_id, guid)).await
    }

    pub async fn get(&self, tenant_id: &str, guid: &str) -> Result<Option<FormSubmission>, StorageError> {
        self.backend.get(&self.event_key(tenant_id, guid)).await
    }

    async fn all_ordered(&self, tenant_id: &str) -> Result<Vec<FormSubmission>, StorageError> {
        let index = self.index(tenant_id).await?;
        let mut events = Vec::with_capacity(index.len());
        for guid in index {
            if let Some(event) = self.get(tenant_id, &guid).await? {
                events.push(event);
            }
        }
        // Event-log iteration is timestamp order, ties broken by GUID (§5).
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.guid.cmp(&b.guid)));
        Ok(events)
    }

    /// All events with `timestamp > t`, ascending (§4.A).
    pub async fn since(&self, tenant_id: &str, t: DateTime<Utc>) -> Result<Vec<FormSubmission>, StorageError> {
        Ok(self
            .all_ordered(tenant_id)
            .await?
            .into_iter()
            .filter(|e| e.timestamp > t)
            .collect())
    }

    /// As `since`, capped at `limit`; the cursor is the timestamp of the
    /// last event returned, or `None` when exhausted (§4.A).
    pub async fn since_paged(
        &self,
        tenant_id: &str,
        t: DateTime<Utc>,
        limit: usize,
    ) -> Result<(Vec<FormSubmission>, Option<DateTime<Utc>>), StorageError> {
        let mut page = self.since(tenant_id, t).await?;
        let next_cursor = if page.len() > limit {
            page.truncate(limit);
            page.last().map(|e| e.timestamp)
        } else {
            None
        };
        Ok((page, next_cursor))
    }

    /// Full ordered event set, used to rebuild the Merkle index.
    pub async fn all(&self, tenant_id: &str) -> Result<Vec<FormSubmission>, StorageError> {
        self.all_ordered(tenant_id).await
    }

    /// Promotes each referenced event's sync-level to the max of its
    /// current level and the level carried on the input (never a
    /// downgrade, §3, §4.A).
    pub async fn promote_sync_level(&self, tenant_id: &str, events: &[FormSubmission]) -> Result<(), StorageError> {
        for carried in events {
            if let Some(mut stored) = self.get(tenant_id, &carried.guid).await? {
                stored.sync_level = stored.sync_level.promoted(carried.sync_level);
                self.backend.set(&self.event_key(tenant_id, &stored.guid), &stored).await?;
            }
        }
        Ok(())
    }

    pub async fn get_sync_timestamp(
        &self,
        tenant_id: &str,
        kind: SyncTimestampKind,
    ) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.backend.get(&self.meta_key(tenant_id, kind)).await
    }

    pub async fn set_sync_timestamp(
        &self,
        tenant_id: &str,
        kind: SyncTimestampKind,
        value: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.backend.set(&self.meta_key(tenant_id, kind), &value).await
    }

    /// The Merkle root persisted alongside the log at the end of the last
    /// append. Compared against a fresh rebuild on startup to detect
    /// tampering (§4.B persistence note).
    pub async fn get_persisted_root(&self, tenant_id: &str) -> Result<Option<String>, StorageError> {
        self.backend.get(&self.root_key(tenant_id)).await
    }

    pub async fn set_persisted_root(&self, tenant_id: &str, root: &str) -> Result<(), StorageError> {
        self.backend.set(&self.root_key(tenant_id), &root.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::json;

    fn event(guid: &str) -> FormSubmission {
        FormSubmission::new(guid, "entity-1", "create-individual", json!({"name": guid}), "user-1")
    }

    #[tokio::test]
    async fn append_rejects_duplicate_guid() {
        let log = EventLog::new(Arc::new(MemoryBackend::new()));
        let e = event("e1");
        log.append("t1", &e).await.unwrap();
        let err = log.append("t1", &e).await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn since_orders_by_timestamp_then_guid() {
        let log = EventLog::new(Arc::new(MemoryBackend::new()));
        let mut e1 = event("b");
        let mut e2 = event("a");
        e1.timestamp = Utc::now();
        e2.timestamp = e1.timestamp;
        log.append("t1", &e1).await.unwrap();
        log.append("t1", &e2).await.unwrap();

        let since = log.since("t1", e1.timestamp - chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].guid, "a");
        assert_eq!(since[1].guid, "b");
    }

    #[tokio::test]
    async fn promote_sync_level_never_downgrades() {
        let log = EventLog::new(Arc::new(MemoryBackend::new()));
        let mut e = event("e1");
        e.sync_level = SyncLevel::Remote;
        log.append("t1", &e).await.unwrap();

        let mut downgrade = e.clone();
        downgrade.sync_level = SyncLevel::Local;
        log.promote_sync_level("t1", std::slice::from_ref(&downgrade)).await.unwrap();

        let stored = log.get("t1", "e1").await.unwrap().unwrap();
        assert_eq!(stored.sync_level, SyncLevel::Remote);
    }

    #[tokio::test]
    async fn since_paged_reports_next_cursor() {
        let log = EventLog::new(Arc::new(MemoryBackend::new()));
        for i in 0..5 {
            let mut e = event(&format!("e{i}"));
            e.timestamp = Utc::now() + chrono::Duration::milliseconds(i);
            log.append("t1", &e).await.unwrap();
        }
        let (page, cursor) = log.since_paged("t1", Utc::now() - chrono::Duration::seconds(1), 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(cursor.is_some());
    }

    #[tokio::test]
    async fn sync_timestamps_round_trip() {
        let log = EventLog::new(Arc::new(MemoryBackend::new()));
        assert!(log.get_sync_timestamp("t1", SyncTimestampKind::LastLocalSync).await.unwrap().is_none());
        let now = Utc::now();
        log.set_sync_timestamp("t1", SyncTimestampKind::LastLocalSync, now).await.unwrap();
        assert_eq!(log.get_sync_timestamp("t1", SyncTimestampKind::LastLocalSync).await.unwrap(), Some(now));
    }

    #[tokio::test]
    async fn persisted_root_round_trips() {
        let log = EventLog::new(Arc::new(MemoryBackend::new()));
        assert!(log.get_persisted_root("t1").await.unwrap().is_none());
        log.set_persisted_root("t1", "abc123").await.unwrap();
        assert_eq!(log.get_persisted_root("t1").await.unwrap(), Some("abc123".to_string()));
    }
}
