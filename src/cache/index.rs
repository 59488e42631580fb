//! Bounded key -> entry index shared by every cache backend.
//!
//! The index owns expiry, capacity and prefix bookkeeping; backends only
//! decide what a payload is (bytes in memory, a file on disk). Every removal
//! hands the entry back so the backend can release its payload outside the
//! lock.

use crate::key::matches_base;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct CacheEntry<P> {
    pub key: String,
    pub payload: P,
    pub len: usize,
    pub content_type: String,
    pub freshness_token: Option<String>,
    pub etag: String,
    pub transformed: bool,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub last_accessed_at: Instant,
    /// Wall-clock insertion time, for `Last-Modified`.
    pub stored_at: OffsetDateTime,
    seq: u64,
}

impl<P> CacheEntry<P> {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// Everything but the payload, as supplied to [`CacheIndex::insert`].
#[derive(Debug, Clone)]
pub struct EntryMeta {
    pub len: usize,
    pub content_type: String,
    pub freshness_token: Option<String>,
    pub etag: String,
    pub transformed: bool,
    pub stored_at: OffsetDateTime,
}

pub enum Lookup<P> {
    Hit(CacheEntry<P>),
    /// The entry had expired and was removed by this lookup.
    Expired(CacheEntry<P>),
    Miss,
}

/// What an insert displaced.
pub struct Displaced<P> {
    pub replaced: Option<CacheEntry<P>>,
    pub evicted: Option<CacheEntry<P>>,
}

pub struct CacheIndex<P> {
    entries: HashMap<String, CacheEntry<P>>,
    max_entries: usize,
    next_seq: u64,
}

impl<P: Clone> CacheIndex<P> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// Sum of payload lengths.
    pub fn total_len(&self) -> u64 {
        self.entries.values().map(|e| e.len as u64).sum()
    }

    /// Looks up `key`, refreshing its access time on a hit.
    pub fn get(&mut self, key: &str, now: Instant) -> Lookup<P> {
        match self.entries.get_mut(key) {
            None => return Lookup::Miss,
            Some(entry) if !entry.is_expired(now) => {
                entry.last_accessed_at = now;
                return Lookup::Hit(entry.clone());
            }
            Some(_) => {}
        }
        match self.entries.remove(key) {
            Some(entry) => Lookup::Expired(entry),
            None => Lookup::Miss,
        }
    }

    /// Inserts or replaces `key`. A new key evicts the least recently
    /// accessed entry first when the index is full.
    pub fn insert(&mut self, key: &str, payload: P, meta: EntryMeta, ttl: Duration, now: Instant) -> Displaced<P> {
        let replaced = self.entries.remove(key);
        let evicted = if replaced.is_none() && self.entries.len() >= self.max_entries {
            self.evict_oldest()
        } else {
            None
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            len: meta.len,
            content_type: meta.content_type,
            freshness_token: meta.freshness_token,
            etag: meta.etag,
            transformed: meta.transformed,
            created_at: now,
            expires_at: now + ttl,
            last_accessed_at: now,
            stored_at: meta.stored_at,
            seq,
        };
        self.entries.insert(key.to_string(), entry);
        debug_assert!(self.entries.len() <= self.max_entries);

        Displaced { replaced, evicted }
    }

    /// Oldest access first, then oldest creation, then insertion order.
    fn evict_oldest(&mut self) -> Option<CacheEntry<P>> {
        let victim = self
            .entries
            .values()
            .min_by_key(|e| (e.last_accessed_at, e.created_at, e.seq))?
            .key
            .clone();
        self.entries.remove(&victim)
    }

    /// Removes `key` only if its current entry satisfies `pred`.
    pub fn remove_if(&mut self, key: &str, pred: impl FnOnce(&CacheEntry<P>) -> bool) -> Option<CacheEntry<P>> {
        if self.entries.get(key).map(pred).unwrap_or(false) {
            self.entries.remove(key)
        } else {
            None
        }
    }

    /// Removes every variant of the source whose base is `base`.
    pub fn remove_base(&mut self, base: &str) -> Vec<CacheEntry<P>> {
        let keys: Vec<String> = self
            .entries
            .keys()
            .filter(|k| matches_base(k, base))
            .cloned()
            .collect();
        keys.iter().filter_map(|k| self.entries.remove(k)).collect()
    }

    pub fn remove_expired(&mut self, now: Instant) -> Vec<CacheEntry<P>> {
        let keys: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();
        keys.iter().filter_map(|k| self.entries.remove(k)).collect()
    }

    pub fn drain(&mut self) -> Vec<CacheEntry<P>> {
        self.entries.drain().map(|(_, e)| e).collect()
    }
}
