//! Variant cache: bounded, expiring storage of transformed images.

pub mod control;
pub mod disk;
pub mod index;
pub mod inflight;
pub mod memory;

pub use control::CacheControl;
pub use disk::DiskCache;
pub use inflight::InFlight;
pub use memory::MemoryCache;

use crate::config::{CacheBackend, CdnConfig};
use crate::Result;
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// A variant ready to be stored.
#[derive(Debug, Clone)]
pub struct NewVariant {
    pub bytes: Bytes,
    pub content_type: String,
    /// Freshness token of the source the variant was derived from.
    pub freshness_token: Option<String>,
    /// False for untransformed originals.
    pub transformed: bool,
}

/// A variant served from the cache.
#[derive(Debug, Clone)]
pub struct CachedVariant {
    pub bytes: Bytes,
    pub content_type: String,
    pub etag: String,
    pub transformed: bool,
    pub stored_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub backend: &'static str,
    pub entry_count: usize,
    pub max_entries: usize,
    pub total_size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
}

/// Operations every cache backend offers.
///
/// All mutations are internally synchronized; callers share one instance
/// behind an `Arc`.
#[async_trait::async_trait]
pub trait CachePolicy: Send + Sync {
    /// Returns the entry for `key`, or `None` if absent or expired. Expired
    /// entries are removed by the lookup.
    async fn get(&self, key: &str) -> Option<CachedVariant>;

    /// [`CachePolicy::get`] without touching the hit and miss counters. For
    /// the second look a request takes after waiting on an in-flight fill, so
    /// each request is counted once, on its first lookup.
    async fn recheck(&self, key: &str) -> Option<CachedVariant>;

    /// Stores a variant, evicting the least recently accessed entry when
    /// full. Returns the stored entry's view.
    async fn put(&self, key: &str, variant: NewVariant, ttl: Duration) -> Result<CachedVariant>;

    /// Removes every variant of the source with base `base`.
    async fn invalidate_prefix(&self, base: &str) -> usize;

    /// Removes every expired entry.
    async fn purge_expired(&self) -> usize;

    /// Removes everything.
    async fn clear(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stats(&self) -> CacheStats;
}

/// Hit/miss/eviction counters shared by the backends.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl CacheCounters {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn evicted(&self, n: usize) {
        self.evictions.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn expired(&self, n: usize) {
        self.expired.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn stats(&self, backend: &'static str, entry_count: usize, max_entries: usize, total_size_bytes: u64) -> CacheStats {
        CacheStats {
            backend,
            entry_count,
            max_entries,
            total_size_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

/// Weak ETag over payload length and a freshness marker.
///
/// The marker is the source's freshness token when known, otherwise the
/// time the variant was stored. Deriving it from the source keeps the tag
/// stable across eviction and re-transform.
pub fn etag_for(len: usize, freshness_token: Option<&str>, stored_at: OffsetDateTime) -> String {
    let marker: String = freshness_token
        .map(|t| t.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '-').collect())
        .filter(|t: &String| !t.is_empty())
        .unwrap_or_else(|| (stored_at.unix_timestamp_nanos() / 1_000_000).to_string());
    format!("W/\"{:x}-{}\"", len, marker)
}

/// Builds the backend selected in `config`.
pub async fn build_cache(config: &CdnConfig) -> Result<Arc<dyn CachePolicy>> {
    let cache: Arc<dyn CachePolicy> = match config.cache_backend {
        CacheBackend::Memory => Arc::new(MemoryCache::new(config.max_entries)),
        CacheBackend::Disk => Arc::new(DiskCache::init(config.cache_dir.clone(), config.max_entries).await?),
    };
    tracing::info!(
        "Variant cache ready: backend={:?}, max_entries={}, ttl={:?}",
        config.cache_backend,
        config.max_entries,
        config.cache_ttl
    );
    Ok(cache)
}
