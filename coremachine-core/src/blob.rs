use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("blob {0} not found")]
    NotFound(String),
    #[error("blob store error: {0}")]
    Store(String),
}

/// Narrow surface over blob storage. Handlers use it to pass oversized
/// intermediate data between stages; the platform layer uses `exists` for
/// submission validation. Production adapters (object stores) are external
/// collaborators implementing this trait.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn read(&self, container: &str, path: &str) -> Result<Vec<u8>, BlobError>;
    async fn write(&self, container: &str, path: &str, data: Vec<u8>) -> Result<(), BlobError>;
    async fn exists(&self, container: &str, path: &str) -> Result<bool, BlobError>;
    /// A time-limited URL granting direct read access to a blob.
    async fn signed_url(
        &self,
        container: &str,
        path: &str,
        ttl_seconds: u64,
    ) -> Result<String, BlobError>;
}

/// In-memory store for tests and local development.
#[derive(Default, Clone)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(container: &str, path: &str) -> String {
        format!("{}/{}", container, path)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn read(&self, container: &str, path: &str) -> Result<Vec<u8>, BlobError> {
        let blobs = self.blobs.read().await;
        blobs
            .get(&Self::key(container, path))
            .cloned()
            .ok_or_else(|| BlobError::NotFound(Self::key(container, path)))
    }

    async fn write(&self, container: &str, path: &str, data: Vec<u8>) -> Result<(), BlobError> {
        let mut blobs = self.blobs.write().await;
        blobs.insert(Self::key(container, path), data);
        Ok(())
    }

    async fn exists(&self, container: &str, path: &str) -> Result<bool, BlobError> {
        let blobs = self.blobs.read().await;
        Ok(blobs.contains_key(&Self::key(container, path)))
    }

    async fn signed_url(
        &self,
        container: &str,
        path: &str,
        ttl_seconds: u64,
    ) -> Result<String, BlobError> {
        if !self.exists(container, path).await? {
            return Err(BlobError::NotFound(Self::key(container, path)));
        }
        Ok(format!(
            "memory://{}/{}?ttl={}",
            container, path, ttl_seconds
        ))
    }
}
