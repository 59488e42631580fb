use super::index::{CacheEntry, CacheIndex, EntryMeta, Lookup};
use super::{etag_for, CacheCounters, CachePolicy, CacheStats, CachedVariant, NewVariant};
use crate::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

/// Variant cache holding payloads in process memory.
pub struct MemoryCache {
    index: Mutex<CacheIndex<Bytes>>,
    counters: CacheCounters,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            index: Mutex::new(CacheIndex::new(max_entries)),
            counters: CacheCounters::default(),
        }
    }
}

fn view(entry: CacheEntry<Bytes>) -> CachedVariant {
    CachedVariant {
        bytes: entry.payload,
        content_type: entry.content_type,
        etag: entry.etag,
        transformed: entry.transformed,
        stored_at: entry.stored_at,
    }
}

impl MemoryCache {
    fn lookup(&self, key: &str, counted: bool) -> Option<CachedVariant> {
        let lookup = self.index.lock().get(key, Instant::now());
        match lookup {
            Lookup::Hit(entry) => {
                if counted {
                    self.counters.hit();
                }
                return Some(view(entry));
            }
            Lookup::Expired(_) => {
                tracing::debug!("Expired cache entry dropped: key={}", key);
                self.counters.expired(1);
            }
            Lookup::Miss => {}
        }
        if counted {
            self.counters.miss();
        }
        None
    }
}

#[async_trait::async_trait]
impl CachePolicy for MemoryCache {
    async fn get(&self, key: &str) -> Option<CachedVariant> {
        self.lookup(key, true)
    }

    async fn recheck(&self, key: &str) -> Option<CachedVariant> {
        self.lookup(key, false)
    }

    async fn put(&self, key: &str, variant: NewVariant, ttl: Duration) -> Result<CachedVariant> {
        let stored_at = OffsetDateTime::now_utc();
        let meta = EntryMeta {
            len: variant.bytes.len(),
            etag: etag_for(variant.bytes.len(), variant.freshness_token.as_deref(), stored_at),
            content_type: variant.content_type.clone(),
            freshness_token: variant.freshness_token,
            transformed: variant.transformed,
            stored_at,
        };
        let etag = meta.etag.clone();

        let displaced = self.index.lock().insert(key, variant.bytes.clone(), meta, ttl, Instant::now());
        if let Some(evicted) = displaced.evicted {
            self.counters.evicted(1);
            tracing::info!("Evicted oldest entry: key={}, size={}", evicted.key, evicted.len);
        }
        tracing::info!("Stored variant: key={}, type={}, size={} bytes", key, variant.content_type, variant.bytes.len());

        Ok(CachedVariant {
            bytes: variant.bytes,
            content_type: variant.content_type,
            etag,
            transformed: variant.transformed,
            stored_at,
        })
    }

    async fn invalidate_prefix(&self, base: &str) -> usize {
        let removed = self.index.lock().remove_base(base).len();
        tracing::info!("Invalidated {} variants of {}", removed, base);
        removed
    }

    async fn purge_expired(&self) -> usize {
        let removed = self.index.lock().remove_expired(Instant::now()).len();
        self.counters.expired(removed);
        tracing::info!("Cleared {} expired cache entries", removed);
        removed
    }

    async fn clear(&self) -> usize {
        let removed = self.index.lock().drain().len();
        tracing::info!("Cache cleared: {} entries removed", removed);
        removed
    }

    fn len(&self) -> usize {
        self.index.lock().len()
    }

    fn stats(&self) -> CacheStats {
        let index = self.index.lock();
        self.counters.stats("memory", index.len(), index.capacity(), index.total_len())
    }
}
