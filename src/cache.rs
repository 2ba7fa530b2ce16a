//! Bounded LRU caches for partition ranges and open partitions.

use crate::partition::Partition;
use crate::range::PartitionRange;
use crate::series::PartitionKey;
use lru::LruCache;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

fn capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

/// Cache of computed partition ranges. Entries expire `ttl` after insertion.
pub struct RangeCache {
    inner: RwLock<LruCache<PartitionKey, (Instant, PartitionRange)>>,
    ttl: Duration,
}

impl RangeCache {
    pub fn new(size: usize, ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(LruCache::new(capacity(size))),
            ttl,
        }
    }

    /// Returns a live entry, dropping it if it has expired.
    pub fn get(&self, key: &PartitionKey) -> Option<PartitionRange> {
        let mut cache = self.inner.write();
        let expired = match cache.get(key) {
            Some((inserted, range)) if inserted.elapsed() < self.ttl => return Some(range.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.pop(key);
            debug!("Range cache entry {} expired", key);
        }
        None
    }

    pub fn insert(&self, range: PartitionRange) {
        self.inner
            .write()
            .put(range.key().clone(), (Instant::now(), range));
    }

    pub fn invalidate(&self, key: &PartitionKey) {
        self.inner.write().pop(key);
    }

    /// Drops every entry belonging to `series_id`.
    pub fn invalidate_series(&self, series_id: &str) {
        let mut cache = self.inner.write();
        let keys: Vec<PartitionKey> = cache
            .iter()
            .filter(|(key, _)| key.series_id == series_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            cache.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Cache of open partitions. A partition pushed out of the cache is closed.
pub struct BufferCache {
    inner: RwLock<LruCache<PartitionKey, Arc<Partition>>>,
}

impl BufferCache {
    pub fn new(size: usize) -> Self {
        Self {
            inner: RwLock::new(LruCache::new(capacity(size))),
        }
    }

    pub fn get(&self, key: &PartitionKey) -> Option<Arc<Partition>> {
        self.inner.write().get(key).cloned()
    }

    /// Returns the cached partition for `key`, inserting `partition` if there is none.
    pub fn get_or_insert(&self, key: PartitionKey, partition: Arc<Partition>) -> Arc<Partition> {
        let evicted = {
            let mut cache = self.inner.write();
            if let Some(existing) = cache.get(&key) {
                return Arc::clone(existing);
            }
            cache
                .push(key, Arc::clone(&partition))
                .map(|(_, evicted)| evicted)
        };

        // Closing takes the partition lock; never do it under the cache lock.
        if let Some(evicted) = evicted {
            close_evicted(&evicted);
        }
        partition
    }

    /// Removes `key` without closing the partition.
    pub fn remove(&self, key: &PartitionKey) -> Option<Arc<Partition>> {
        self.inner.write().pop(key)
    }

    /// Removes every partition of `series_id`, returning them for the caller to close.
    pub fn remove_series(&self, series_id: &str) -> Vec<Arc<Partition>> {
        let mut cache = self.inner.write();
        let keys: Vec<PartitionKey> = cache
            .iter()
            .filter(|(key, _)| key.series_id == series_id)
            .map(|(key, _)| key.clone())
            .collect();
        keys.iter().filter_map(|key| cache.pop(key)).collect()
    }

    /// Snapshot of every cached partition.
    pub fn partitions(&self) -> Vec<Arc<Partition>> {
        self.inner
            .read()
            .iter()
            .map(|(_, partition)| Arc::clone(partition))
            .collect()
    }

    /// Empties the cache, returning the removed partitions.
    pub fn clear(&self) -> Vec<Arc<Partition>> {
        let mut cache = self.inner.write();
        let partitions = cache.iter().map(|(_, p)| Arc::clone(p)).collect();
        cache.clear();
        partitions
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

fn close_evicted(partition: &Partition) {
    debug!("Evicting partition {}", partition.range().key());
    if let Err(e) = partition.close() {
        warn!(
            "Failed to close evicted partition {}: {}",
            partition.range().key(),
            e
        );
    }
}
