use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;

use crate::error::Result;

/// Low-latency key/value cache backing the Active tier.
///
/// Every method may fail with [`ContextError::Cache`](crate::ContextError::Cache);
/// the store treats such failures as a degraded tier, never as a hard error.
#[async_trait]
pub trait ActiveCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    /// Returns `true` when a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn ping(&self) -> Result<()>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Bounded in-process LRU with per-entry expiry.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, Entry>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ActiveCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.lock();
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some(entry) if entry.expires_at > Instant::now() => {
                return Ok(Some(entry.value.clone()))
            }
            Some(_) => true,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.lock().put(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self
            .lock()
            .pop(key)
            .is_some_and(|entry| entry.expires_at > Instant::now()))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
