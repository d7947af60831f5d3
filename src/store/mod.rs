//! Object-store abstraction holding bundles keyed by zero-padded block
//! numbers.
//!
//! Writes are whole-object: a bundle is assembled in memory and handed to
//! [`ObjectStore::write`] once, so a reader never observes a half-written
//! bundle under its final key.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod local;
mod memory;

pub use local::LocalStore;
pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("unsupported store URL: {0}")]
    InvalidUrl(String),
    #[error("invalid object key: {0:?}")]
    InvalidKey(String),
    #[error("store I/O error on {key:?}: {source}")]
    Io { key: String, source: std::io::Error },
    #[error("operation cancelled")]
    Cancelled,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Keys starting with `prefix`, in lexical order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn open(&self, key: &str) -> Result<Bytes, StoreError>;

    async fn write(&self, key: &str, data: Bytes) -> Result<(), StoreError>;

    /// Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Resolve a store URL: `memory://`, `file:///some/dir` or a bare path.
pub fn open_store(url: &str) -> Result<Arc<dyn ObjectStore>, StoreError> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(Arc::new(LocalStore::new(path)));
    }
    if url.contains("://") {
        return Err(StoreError::InvalidUrl(url.to_string()));
    }
    Ok(Arc::new(LocalStore::new(url)))
}

/// Run a store call unless `token` fires first.
pub async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(StoreError::Cancelled),
        res = fut => res,
    }
}
