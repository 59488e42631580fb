//! Per-key serialization of cache-miss work.
//!
//! Concurrent misses for the same variant key queue on one async mutex, so
//! only the first fetches and transforms; the rest find the result in the
//! cache once they get the lock.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

#[derive(Default)]
pub struct InFlight {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held while a key's miss is being filled. Dropping it releases the key and
/// forgets the lock once nobody else waits on it.
pub struct KeyGuard<'a> {
    owner: &'a InFlight,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = lock.lock_owned().await;
        KeyGuard { owner: self, key: key.to_string(), guard: Some(guard) }
    }

    /// Keys currently being filled or waited on.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.owner.locks.lock();
        // Only the map holds the lock: no waiter and no holder left
        if locks.get(&self.key).map(|l| Arc::strong_count(l) == 1).unwrap_or(false) {
            locks.remove(&self.key);
        }
    }
}
