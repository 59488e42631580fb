use super::{Blob, BlobStore};
use crate::{CdnError, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-process blob store for tests and local development.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<HashMap<String, Blob>>,
    revision: AtomicU64,
    gets: AtomicU64,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls served, hits and misses alike.
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Blob> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| CdnError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<()> {
        let revision = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
        let blob = Blob {
            bytes,
            content_type: Some(content_type.to_string()),
            etag: Some(format!("\"rev-{}\"", revision)),
        };
        self.objects.write().insert(key.to_string(), blob);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().remove(key);
        Ok(())
    }
}
