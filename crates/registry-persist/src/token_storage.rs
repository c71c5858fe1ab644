//! Auth token storage (§6). The core only consumes tokens — login itself
//! is an external collaborator (§1).

use async_trait::async_trait;
use std::sync::Arc;

use crate::backend::{StorageBackend, StorageError, StorageExt};

/// `get/set/remove(provider, token)`, `get_username/set_username`, `clear`
/// (§6).
#[async_trait]
pub trait TokenStorage: Send + Sync {
    async fn get_token(&self, provider: &str) -> Result<Option<String>, StorageError>;
    async fn set_token(&self, provider: &str, token: &str) -> Result<(), StorageError>;
    async fn remove_token(&self, provider: &str) -> Result<(), StorageError>;
    async fn get_username(&self, provider: &str) -> Result<Option<String>, StorageError>;
    async fn set_username(&self, provider: &str, username: &str) -> Result<(), StorageError>;
    async fn clear(&self) -> Result<(), StorageError>;
}

/// Backend-backed token store. `provider` is typically `"server"` for the
/// internal sync transport, or an external adapter's name.
#[derive(Debug)]
pub struct BackendTokenStorage<B: StorageBackend + ?Sized> {
    backend: Arc<B>,
    prefix: String,
}

impl<B: StorageBackend + ?Sized> BackendTokenStorage<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            prefix: "auth:".to_string(),
        }
    }

    fn token_key(&self, provider: &str) -> String {
        format!("{}token:{}", self.prefix, provider)
    }

    fn username_key(&self, provider: &str) -> String {
        format!("{}username:{}", self.prefix, provider)
    }
}

#[async_trait]
impl<B: StorageBackend + ?Sized> TokenStorage for BackendTokenStorage<B> {
    async fn get_token(&self, provider: &str) -> Result<Option<String>, StorageError> {
        self.backend.get(&self.token_key(provider)).await
    }

    async fn set_token(&self, provider: &str, token: &str) -> Result<(), StorageError> {
        self.backend.set(&self.token_key(provider), &token.to_string()).await
    }

    async fn remove_token(&self, provider: &str) -> Result<(), StorageError> {
        self.backend.delete(&self.token_key(provider)).await?;
        Ok(())
    }

    async fn get_username(&self, provider: &str) -> Result<Option<String>, StorageError> {
        self.backend.get(&self.username_key(provider)).await
    }

    async fn set_username(&self, provider: &str, username: &str) -> Result<(), StorageError> {
        self.backend.set(&self.username_key(provider), &username.to_string()).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        for key in self.backend.list_keys(&self.prefix).await? {
            self.backend.delete(&key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[tokio::test]
    async fn token_round_trips_and_clears() {
        let store = BackendTokenStorage::new(Arc::new(MemoryBackend::new()));
        assert!(store.get_token("server").await.unwrap().is_none());

        store.set_token("server", "abc123").await.unwrap();
        store.set_username("server", "ann").await.unwrap();
        assert_eq!(store.get_token("server").await.unwrap(), Some("abc123".to_string()));
        assert_eq!(store.get_username("server").await.unwrap(), Some("ann".to_string()));

        store.clear().await.unwrap();
        assert!(store.get_token("server").await.unwrap().is_none());
        assert!(store.get_username("server").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_token_clears_only_token() {
        let store = BackendTokenStorage::new(Arc::new(MemoryBackend::new()));
        store.set_token("server", "abc123").await.unwrap();
        store.set_username("server", "ann").await.unwrap();
        store.remove_token("server").await.unwrap();
        assert!(store.get_token("server").await.unwrap().is_none());
        assert_eq!(store.get_username("server").await.unwrap(), Some("ann".to_string()));
    }
}
