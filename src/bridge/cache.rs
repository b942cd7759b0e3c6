use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::types::Row;

/// Result cache consulted for the cached strategy, keyed by plan fingerprint.
pub trait ResultCache: Send + Sync {
    /// Returns a result that is still within its time-to-live.
    fn get(&self, fingerprint: u64) -> Option<Arc<Vec<Row>>>;

    /// Stores a complete result for `ttl`.
    fn put(&self, fingerprint: u64, rows: Arc<Vec<Row>>, ttl: Duration);
}

struct CacheEntry {
    rows: Arc<Vec<Row>>,
    expires_at: Instant,
}

/// In-process LRU cache with per-entry expiry.
pub struct LruResultCache {
    entries: Mutex<LruCache<u64, CacheEntry>>,
}

impl LruResultCache {
    /// Creates a cache holding at most `capacity` results.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Results currently held, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LruResultCache {
    fn default() -> Self {
        Self::new(64)
    }
}

impl ResultCache for LruResultCache {
    fn get(&self, fingerprint: u64) -> Option<Arc<Vec<Row>>> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(&fingerprint) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Some(Arc::clone(&entry.rows));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(&fingerprint);
            debug!(fingerprint, "bridge.cache.expired");
        }
        None
    }

    fn put(&self, fingerprint: u64, rows: Arc<Vec<Row>>, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .put(fingerprint, CacheEntry { rows, expires_at });
    }
}
