//! Blob source adapter: reads original image bytes from the backing store.

pub mod fs;
pub mod http;
pub mod memory;

use crate::catalog::SourceRecord;
use crate::{CdnError, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

pub use fs::FsBlobStore;
pub use http::HttpBlobStore;
pub use memory::MemoryBlobStore;

/// Raw object as returned by a [`BlobStore`].
#[derive(Debug, Clone)]
pub struct Blob {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    /// ETag or modification marker reported by the store.
    pub etag: Option<String>,
}

/// Content-addressable object store holding the original uploads.
///
/// Implementations report a missing object as [`CdnError::NotFound`] and
/// network or service faults as [`CdnError::Transient`].
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Blob>;
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Immutable description of an original image.
#[derive(Debug, Clone)]
pub struct SourceObject {
    pub key: String,
    pub content_type: String,
    pub size_bytes: usize,
    pub freshness_token: Option<String>,
    pub is_private: bool,
    pub owner_id: Option<String>,
}

/// Wraps a [`BlobStore`] with a bounded timeout, a single retry on
/// transient faults and empty-body detection.
#[derive(Clone)]
pub struct BlobSource {
    store: Arc<dyn BlobStore>,
    timeout: Duration,
}

impl BlobSource {
    pub fn new(store: Arc<dyn BlobStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    async fn get_once(&self, key: &str) -> Result<Blob> {
        match tokio::time::timeout(self.timeout, self.store.get(key)).await {
            Ok(res) => res,
            Err(_) => Err(CdnError::Transient(format!(
                "fetch of {} timed out after {:?}",
                key, self.timeout
            ))),
        }
    }

    /// Fetches the full body of the object `record` points at.
    ///
    /// Each attempt is bounded by the configured timeout. A transient
    /// failure (timeout, 5xx, connection error) is retried exactly once.
    ///
    /// # Parameters
    /// * `record` - Resolved metadata; `storage_key` names the blob
    ///
    /// # Returns
    /// The [`SourceObject`] describing the blob, with the content type taken
    /// from the store, else the record, else `application/octet-stream`, and
    /// the body bytes.
    ///
    /// # Errors
    /// - `CdnError::NotFound` if the store has no such key
    /// - `CdnError::Transient` if both attempts fail transiently
    /// - `CdnError::EmptyBody` if the store returns zero bytes
    pub async fn fetch(&self, record: &SourceRecord) -> Result<(SourceObject, Bytes)> {
        let key = record.storage_key.as_str();
        let blob = match self.get_once(key).await {
            Err(CdnError::Transient(reason)) => {
                tracing::warn!("Transient fetch failure for {}, retrying once: {}", key, reason);
                self.get_once(key).await?
            }
            other => other?,
        };

        if blob.bytes.is_empty() {
            tracing::error!("Empty body received for {}", key);
            return Err(CdnError::EmptyBody(key.to_string()));
        }

        let content_type = blob
            .content_type
            .filter(|ct| !ct.is_empty())
            .or_else(|| record.content_type.clone())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        tracing::debug!(
            "Fetched {} ({} bytes, type={}, etag={:?})",
            key,
            blob.bytes.len(),
            content_type,
            blob.etag
        );

        let object = SourceObject {
            key: key.to_string(),
            content_type,
            size_bytes: blob.bytes.len(),
            freshness_token: blob.etag,
            is_private: record.is_private,
            owner_id: record.owner_id.clone(),
        };
        Ok((object, blob.bytes))
    }
}
