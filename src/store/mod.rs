//! Blob storage for archive repositories.
//!
//! A [`BlobStore`] is a flat key-value namespace of byte blobs (a local
//! directory, an S3 bucket prefix, or memory in tests). A [`Repository`] scopes
//! a store to one crawl target and layers the higher-level operations on top:
//! lazy creation, glob listing, text I/O and atomic multi-operation commits.

mod local;
mod memory;
mod multipart;
mod repository;
mod s3;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;

use crate::config::{Config, StorageBackend};

pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;
pub use repository::{CommitOperation, CommitSource, ObjectInfo, Repository};
pub use s3::S3BlobStore;

/// Errors surfaced by storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage temporarily unavailable: {0}")]
    Transient(String),
    /// A local file could not be read or written.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Only failures of the remote store qualify; a missing or unreadable
    /// local file stays that way.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Primitive blob operations a storage backend must provide.
///
/// Keys are `/`-separated and never start with a slash.
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    /// Make sure the backing namespace exists.
    async fn ensure_root(&self) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Read a whole blob. Missing keys yield [`StoreError::NotFound`].
    async fn read(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// Write a whole blob, replacing any previous content atomically.
    async fn write(&self, key: &str, data: &[u8]) -> StoreResult<()>;

    async fn size(&self, key: &str) -> StoreResult<u64>;

    /// List every key starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;

    async fn copy(&self, from: &str, to: &str) -> StoreResult<()>;

    /// Delete a blob. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Public download URL for a key.
    fn public_url(&self, key: &str) -> String;

    /// Download a blob into a local file.
    async fn download_to(&self, key: &str, local: &Path) -> StoreResult<()> {
        let data = self.read(key).await?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, data).await?;
        Ok(())
    }

    /// Upload a local file as a blob.
    async fn upload_from(&self, local: &Path, key: &str) -> StoreResult<()> {
        let data = tokio::fs::read(local).await?;
        self.write(key, &data).await
    }
}

/// Build the blob store selected by the configuration.
///
/// # Errors
///
/// Returns an error if the S3 client cannot be initialized.
pub async fn open_backend(config: &Config) -> Result<Arc<dyn BlobStore>> {
    match config.storage_backend {
        StorageBackend::Local => Ok(Arc::new(LocalBlobStore::new(&config.local_storage_root))),
        StorageBackend::S3 => {
            let store = S3BlobStore::new(config)
                .await
                .context("Failed to initialize S3 client")?;
            Ok(Arc::new(store))
        }
    }
}
