//! In-memory cache of decoded results.
//!
//! Maps request keys to shared [`BitmapResult`]s with least-recently-used
//! eviction bounded by a byte budget. The cache is owned by the coordination
//! context, so it takes `&mut self` and needs no locking.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::bitmap::BitmapResult;
use crate::key::RequestKey;

/// Default memory budget: 64MB
pub const DEFAULT_MEMORY_CACHE_CAPACITY: usize = 64 * 1024 * 1024;

/// Default maximum number of entries (to bound LRU overhead)
const DEFAULT_MAX_ENTRIES: NonZeroUsize = match NonZeroUsize::new(10_000) {
    Some(n) => n,
    None => unreachable!(),
};

// =============================================================================
// Keyed Result Cache
// =============================================================================

/// LRU cache of decoded results with size-based capacity.
///
/// # Example
///
/// ```ignore
/// use bitmap_pipeline::cache::KeyedResultCache;
///
/// let mut cache = KeyedResultCache::with_capacity(16 * 1024 * 1024);
/// cache.put(result.key().clone(), result.clone());
/// assert!(cache.get(result.key()).is_some());
/// ```
pub struct KeyedResultCache {
    cache: LruCache<RequestKey, Arc<BitmapResult>>,

    /// Maximum total size in bytes
    max_size: usize,

    /// Current total size in bytes
    current_size: usize,
}

impl KeyedResultCache {
    /// Create a cache with the default budget (64MB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CACHE_CAPACITY)
    }

    /// Create a cache holding at most `max_size` bytes of decoded pixels.
    pub fn with_capacity(max_size: usize) -> Self {
        Self::with_capacity_and_entries(max_size, DEFAULT_MAX_ENTRIES)
    }

    /// Create a cache with both a byte budget and an entry limit.
    pub fn with_capacity_and_entries(max_size: usize, max_entries: NonZeroUsize) -> Self {
        Self {
            cache: LruCache::new(max_entries),
            max_size,
            current_size: 0,
        }
    }

    /// Look up a result, marking it recently used.
    pub fn get(&mut self, key: &RequestKey) -> Option<Arc<BitmapResult>> {
        self.cache.get(key).cloned()
    }

    /// Check for a result without touching LRU order.
    pub fn contains(&self, key: &RequestKey) -> bool {
        self.cache.contains(key)
    }

    /// Insert a result, evicting least-recently-used entries until the cache
    /// is back within budget.
    pub fn put(&mut self, key: RequestKey, result: Arc<BitmapResult>) {
        let size = result.byte_size();

        if let Some(old) = self.cache.peek(&key) {
            self.current_size = self.current_size.saturating_sub(old.byte_size());
        }

        // Entry-count eviction happens inside the LRU; keep the byte total in step
        if let Some((evicted_key, evicted)) = self.cache.push(key.clone(), result) {
            if evicted_key != key {
                self.current_size = self.current_size.saturating_sub(evicted.byte_size());
            }
        }
        self.current_size += size;

        while self.current_size > self.max_size {
            match self.cache.pop_lru() {
                Some((_, evicted)) => {
                    self.current_size = self.current_size.saturating_sub(evicted.byte_size());
                }
                None => break,
            }
        }
    }

    /// Evict a single entry.
    pub fn remove(&mut self, key: &RequestKey) -> Option<Arc<BitmapResult>> {
        let removed = self.cache.pop(key)?;
        self.current_size = self.current_size.saturating_sub(removed.byte_size());
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.current_size = 0;
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Current total size in bytes.
    pub fn size(&self) -> usize {
        self.current_size
    }

    /// Maximum capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

impl Default for KeyedResultCache {
    fn default() -> Self {
        Self::new()
    }
}
