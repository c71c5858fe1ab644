//! The Internal Sync Engine (§4.G): push then pull against one server
//! config, guarded by a single-bit `is_syncing` latch and honouring
//! cancellation at chunk/batch boundaries (§5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use registry_core::{AuditEntry, EngineError, EngineResult, FormSubmission, SyncLevel};
use registry_engine::Registry;
use registry_persist::{StorageBackend, SyncTimestampKind, TokenStorage};

use crate::transport::{SyncTransport, TransportError};

/// Tunable push/pull parameters (§4.G, §9 Open Question defaults).
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub config_id: String,
    pub chunk_size: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub push_timeout: Duration,
    /// Key under which the server auth token is stored in `TokenStorage`.
    pub token_provider: String,
}

impl SyncConfig {
    pub fn new(config_id: impl Into<String>) -> Self {
        Self {
            config_id: config_id.into(),
            chunk_size: 10,
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            push_timeout: Duration::from_secs(30),
            token_provider: "server".to_string(),
        }
    }
}

/// A cooperative cancellation flag checked at chunk/batch boundaries.
/// The teacher's codebase has no `tokio-util::CancellationToken`
/// dependency; a bare `AtomicBool` is the idiom it uses for shared state
/// flags elsewhere (see the circuit breaker's counters).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one `sync()` call.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub pushed: usize,
    pub pulled: usize,
    pub cancelled: bool,
}

/// Drives push-then-pull for one tenant's [`Registry`] against one
/// [`SyncTransport`] (§4.G). `sync()` is not re-entrant: a concurrent
/// second call while one is in flight returns immediately with a
/// cancelled-looking no-op outcome (§5 `is_syncing` latch).
pub struct InternalSyncEngine<B: StorageBackend + ?Sized> {
    registry: Arc<Registry<B>>,
    transport: Arc<dyn SyncTransport>,
    token_storage: Arc<dyn TokenStorage>,
    config: SyncConfig,
    is_syncing: AtomicBool,
}

impl<B: StorageBackend + ?Sized + 'static> InternalSyncEngine<B> {
    pub fn new(
        registry: Arc<Registry<B>>,
        transport: Arc<dyn SyncTransport>,
        token_storage: Arc<dyn TokenStorage>,
        config: SyncConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            token_storage,
            config,
            is_syncing: AtomicBool::new(false),
        }
    }

    /// Runs push then pull once. Returns `Ok(None)` if another sync was
    /// already in flight (§5 `is_syncing` latch: "second concurrent call
    /// returns without action").
    pub async fn sync(&self) -> EngineResult<Option<SyncOutcome>> {
        self.sync_cancellable(&CancelToken::new()).await
    }

    pub async fn sync_cancellable(&self, cancel: &CancelToken) -> EngineResult<Option<SyncOutcome>> {
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(None);
        }
        let result = self.sync_inner(cancel).await;
        self.is_syncing.store(false, Ordering::SeqCst);
        result.map(Some)
    }

    async fn sync_inner(&self, cancel: &CancelToken) -> EngineResult<SyncOutcome> {
        let token = self
            .token_storage
            .get_token(&self.config.token_provider)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?
            .ok_or_else(|| EngineError::Unauthorized(format!("no token stored for provider {}", self.config.token_provider)))?;

        let duplicates = self.registry.list_duplicates().await?;
        if !duplicates.is_empty() {
            tracing::warn!(tenant_id = %self.registry.tenant_id(), count = duplicates.len(), "sync blocked by unresolved duplicates");
            return Err(EngineError::DuplicatesPending { count: duplicates.len() });
        }

        tracing::info!(tenant_id = %self.registry.tenant_id(), config_id = %self.config.config_id, "sync: push phase starting");
        let mut outcome = SyncOutcome::default();
        let push_result = self.push(&token, cancel, &mut outcome).await;
        if cancel.is_cancelled() {
            tracing::info!(tenant_id = %self.registry.tenant_id(), "sync: cancelled during push");
            outcome.cancelled = true;
            return Ok(outcome);
        }
        push_result?;

        tracing::info!(tenant_id = %self.registry.tenant_id(), pushed = outcome.pushed, "sync: pull phase starting");
        self.pull(&token, cancel, &mut outcome).await?;
        if cancel.is_cancelled() {
            tracing::info!(tenant_id = %self.registry.tenant_id(), "sync: cancelled during pull");
            outcome.cancelled = true;
        }
        Ok(outcome)
    }

    /// Local -> server. Chunks outstanding events, pushes each chunk with
    /// retry, promotes sync-level only for chunks that land, then mirrors
    /// the tenant's new audit entries the same way (§2, §4.D, §6).
    async fn push(&self, token: &str, cancel: &CancelToken, outcome: &mut SyncOutcome) -> EngineResult<()> {
        let last_sync = self
            .registry
            .sync_timestamp(SyncTimestampKind::LastLocalSync)
            .await?
            .unwrap_or_else(|| chrono::DateTime::<Utc>::MIN_UTC);
        let pending = self.registry.events_since(last_sync).await?;

        for chunk in pending.chunks(self.config.chunk_size) {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.push_chunk_with_retry(token, chunk).await {
                Ok(()) => {
                    self.promote_and_record(chunk).await?;
                    outcome.pushed += chunk.len();
                }
                Err(e) => {
                    return Err(EngineError::Transport(e.to_string()));
                }
            }
        }

        let pending_audit = self.registry.audit_since(last_sync).await?;
        for chunk in pending_audit.chunks(self.config.chunk_size) {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.push_audit_chunk_with_retry(token, chunk)
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?;
            self.promote_audit(chunk).await?;
        }
        Ok(())
    }

    async fn push_chunk_with_retry(&self, token: &str, chunk: &[FormSubmission]) -> Result<(), TransportError> {
        let mut attempt = 0;
        loop {
            match tokio::time::timeout(self.config.push_timeout, self.transport.push(&self.config.config_id, token, chunk)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "push chunk failed, retrying");
                    tokio::time::sleep(self.config.backoff_base * attempt).await;
                }
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) if attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, "push chunk timed out, retrying");
                    tokio::time::sleep(self.config.backoff_base * attempt).await;
                }
                Err(_elapsed) => return Err(TransportError::Transient("push timed out".into())),
            }
        }
    }

    async fn push_audit_chunk_with_retry(&self, token: &str, chunk: &[AuditEntry]) -> Result<(), TransportError> {
        let mut attempt = 0;
        loop {
            match tokio::time::timeout(self.config.push_timeout, self.transport.push_audit(&self.config.config_id, token, chunk)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "push audit chunk failed, retrying");
                    tokio::time::sleep(self.config.backoff_base * attempt).await;
                }
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) if attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, "push audit chunk timed out, retrying");
                    tokio::time::sleep(self.config.backoff_base * attempt).await;
                }
                Err(_elapsed) => return Err(TransportError::Transient("push audit timed out".into())),
            }
        }
    }

    async fn promote_audit(&self, chunk: &[AuditEntry]) -> EngineResult<()> {
        let mut promoted = chunk.to_vec();
        for entry in &mut promoted {
            entry.sync_level = SyncLevel::Remote;
        }
        self.registry
            .pipeline()
            .audit_log()
            .promote_sync_level(self.registry.tenant_id(), &promoted)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    async fn promote_and_record(&self, chunk: &[FormSubmission]) -> EngineResult<()> {
        let mut promoted = chunk.to_vec();
        for event in &mut promoted {
            event.sync_level = SyncLevel::Remote;
        }
        self.registry
            .pipeline()
            .event_log()
            .promote_sync_level(self.registry.tenant_id(), &promoted)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        if let Some(last) = chunk.last() {
            self.registry
                .set_sync_timestamp(SyncTimestampKind::LastLocalSync, last.timestamp)
                .await?;
        }
        Ok(())
    }

    /// Server -> local. Pages forward from `last_remote_sync`, submitting
    /// each new event through the Command Pipeline with sync-level
    /// `REMOTE`, skipping events already known locally (§4.G).
    async fn pull(&self, token: &str, cancel: &CancelToken, outcome: &mut SyncOutcome) -> EngineResult<()> {
        let mut cursor = self
            .registry
            .sync_timestamp(SyncTimestampKind::LastRemoteSync)
            .await?
            .map(|t| t.to_rfc3339());

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let page = self
                .pull_page_with_retry(token, cursor.as_deref())
                .await
                .map_err(|e| EngineError::Transport(e.to_string()))?;

            let mut batch = page.events;
            batch.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

            let last_timestamp = match self.apply_batch(&batch).await {
                Ok(t) => t,
                Err(e) => return Err(e),
            };

            if let Some(t) = last_timestamp {
                self.registry.set_sync_timestamp(SyncTimestampKind::LastRemoteSync, t).await?;
                outcome.pulled += batch.len();
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(())
    }

    async fn pull_page_with_retry(&self, token: &str, cursor: Option<&str>) -> Result<crate::transport::PullPage, TransportError> {
        let mut attempt = 0;
        loop {
            match self.transport.pull(&self.config.config_id, token, cursor).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tokio::time::sleep(self.config.backoff_base * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Applies one pulled batch, returning the timestamp to advance the
    /// cursor to on success. A mid-batch submit failure leaves
    /// `last_remote_sync` untouched, i.e. rolled back to its previous
    /// value (§4.G per-batch failure semantics).
    async fn apply_batch(&self, batch: &[FormSubmission]) -> EngineResult<Option<chrono::DateTime<Utc>>> {
        let mut last = None;
        for event in batch {
            if self
                .registry
                .pipeline()
                .event_log()
                .exists(self.registry.tenant_id(), &event.guid)
                .await
                .map_err(|e| EngineError::Storage(e.to_string()))?
            {
                last = Some(event.timestamp);
                continue;
            }
            let mut remote_event = event.clone();
            remote_event.sync_level = SyncLevel::Remote;
            self.registry.submit(remote_event).await?;
            last = Some(event.timestamp);
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use registry_persist::{BackendTokenStorage, MemoryBackend};
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct MockTransport {
        pushed: Mutex<Vec<FormSubmission>>,
        pushed_audit: Mutex<Vec<AuditEntry>>,
        pull_pages: AsyncMutex<Vec<crate::transport::PullPage>>,
        fail_push_times: Mutex<u32>,
    }

    #[async_trait]
    impl SyncTransport for MockTransport {
        async fn push(&self, _config_id: &str, _token: &str, events: &[FormSubmission]) -> Result<(), TransportError> {
            let mut remaining = self.fail_push_times.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Transient("simulated 503".into()));
            }
            self.pushed.lock().unwrap().extend_from_slice(events);
            Ok(())
        }

        async fn pull(&self, _config_id: &str, _token: &str, _cursor: Option<&str>) -> Result<crate::transport::PullPage, TransportError> {
            let mut pages = self.pull_pages.lock().await;
            if pages.is_empty() {
                return Ok(crate::transport::PullPage {
                    events: Vec::new(),
                    next_cursor: None,
                });
            }
            Ok(pages.remove(0))
        }

        async fn push_audit(&self, _config_id: &str, _token: &str, entries: &[AuditEntry]) -> Result<(), TransportError> {
            self.pushed_audit.lock().unwrap().extend_from_slice(entries);
            Ok(())
        }
    }

    async fn registry() -> Arc<Registry<MemoryBackend>> {
        Arc::new(Registry::new("tenant-1", Arc::new(MemoryBackend::new())).await.unwrap())
    }

    async fn authorized_token_storage() -> Arc<dyn TokenStorage> {
        let store = BackendTokenStorage::new(Arc::new(MemoryBackend::new()));
        store.set_token("server", "test-token").await.unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn push_promotes_sync_level_after_success() {
        let reg = registry().await;
        reg.submit(FormSubmission::new("e1", "g1", "create-individual", json!({"name": "Ann"}), "u1"))
            .await
            .unwrap();

        let transport = Arc::new(MockTransport::default());
        let engine = InternalSyncEngine::new(reg.clone(), transport.clone(), authorized_token_storage().await, SyncConfig::new("cfg-1"));
        let outcome = engine.sync().await.unwrap().unwrap();

        assert_eq!(outcome.pushed, 1);
        assert_eq!(transport.pushed.lock().unwrap().len(), 1);
        let stored = reg.pipeline().event_log().get("tenant-1", "e1").await.unwrap().unwrap();
        assert_eq!(stored.sync_level, SyncLevel::Remote);
    }

    #[tokio::test]
    async fn push_mirrors_audit_entries_and_promotes_sync_level() {
        let reg = registry().await;
        reg.submit(FormSubmission::new("e1", "g1", "create-individual", json!({"name": "Ann"}), "u1"))
            .await
            .unwrap();

        let transport = Arc::new(MockTransport::default());
        let engine = InternalSyncEngine::new(reg.clone(), transport.clone(), authorized_token_storage().await, SyncConfig::new("cfg-1"));
        engine.sync().await.unwrap().unwrap();

        assert_eq!(transport.pushed_audit.lock().unwrap().len(), 1);
        let entries = reg.audit_for_entity("g1").await.unwrap();
        assert_eq!(entries[0].sync_level, SyncLevel::Remote);
    }

    #[tokio::test]
    async fn sync_aborts_with_unauthorized_when_token_missing() {
        let reg = registry().await;
        let transport = Arc::new(MockTransport::default());
        let empty_tokens: Arc<dyn TokenStorage> = Arc::new(BackendTokenStorage::new(Arc::new(MemoryBackend::new())));
        let engine = InternalSyncEngine::new(reg, transport, empty_tokens, SyncConfig::new("cfg-1"));

        let err = engine.sync().await.unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn push_retries_transient_failures() {
        let reg = registry().await;
        reg.submit(FormSubmission::new("e1", "g1", "create-individual", json!({"name": "Ann"}), "u1"))
            .await
            .unwrap();

        let transport = Arc::new(MockTransport {
            fail_push_times: Mutex::new(2),
            ..Default::default()
        });
        let engine = InternalSyncEngine::new(
            reg.clone(),
            transport.clone(),
            authorized_token_storage().await,
            SyncConfig {
                backoff_base: Duration::from_millis(1),
                ..SyncConfig::new("cfg-1")
            },
        );
        let outcome = engine.sync().await.unwrap().unwrap();
        assert_eq!(outcome.pushed, 1);
    }

    #[tokio::test]
    async fn pull_skips_events_already_known_locally() {
        let reg = registry().await;
        let existing = FormSubmission::new("e1", "g1", "create-individual", json!({"name": "Ann"}), "u1");
        reg.submit(existing.clone()).await.unwrap();

        let transport = Arc::new(MockTransport::default());
        transport.pull_pages.lock().await.push(crate::transport::PullPage {
            events: vec![existing],
            next_cursor: None,
        });

        let engine = InternalSyncEngine::new(reg.clone(), transport, authorized_token_storage().await, SyncConfig::new("cfg-1"));
        engine.sync().await.unwrap().unwrap();
        assert_eq!(reg.pipeline().event_log().all("tenant-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pull_applies_new_remote_events_through_pipeline() {
        let reg = registry().await;
        let transport = Arc::new(MockTransport::default());
        let remote_event = FormSubmission::new("e2", "g2", "create-individual", json!({"name": "Bob"}), "server");
        transport.pull_pages.lock().await.push(crate::transport::PullPage {
            events: vec![remote_event],
            next_cursor: None,
        });

        let engine = InternalSyncEngine::new(reg.clone(), transport, authorized_token_storage().await, SyncConfig::new("cfg-1"));
        let outcome = engine.sync().await.unwrap().unwrap();
        assert_eq!(outcome.pulled, 1);
        assert!(reg.get("g2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_sync_second_call_is_a_no_op() {
        let reg = registry().await;
        let transport = Arc::new(MockTransport::default());
        let engine = Arc::new(InternalSyncEngine::new(reg, transport, authorized_token_storage().await, SyncConfig::new("cfg-1")));

        engine.is_syncing.store(true, Ordering::SeqCst);
        let result = engine.sync().await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn sync_aborts_when_duplicates_pending() {
        let reg = registry().await;
        reg.submit(FormSubmission::new("e1", "g1", "create-individual", json!({"name": "Ann"}), "u1"))
            .await
            .unwrap();
        reg.submit(FormSubmission::new("e2", "g2", "create-individual", json!({"name": "Ann"}), "u1"))
            .await
            .unwrap();

        let transport = Arc::new(MockTransport::default());
        let engine = InternalSyncEngine::new(reg, transport, authorized_token_storage().await, SyncConfig::new("cfg-1"));
        let err = engine.sync().await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicatesPending { .. }));
    }

    #[tokio::test]
    async fn cancellation_mid_push_retains_partial_progress() {
        let reg = registry().await;
        for i in 0..25 {
            reg.submit(FormSubmission::new(format!("e{i}"), format!("g{i}"), "create-individual", json!({"name": i}), "u1"))
                .await
                .unwrap();
        }

        let transport = Arc::new(MockTransport::default());
        let engine = InternalSyncEngine::new(reg.clone(), transport.clone(), authorized_token_storage().await, SyncConfig::new("cfg-1"));
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = engine.sync_cancellable(&cancel).await.unwrap().unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.pushed, 0);
    }
}
