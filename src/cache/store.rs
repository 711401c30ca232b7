//! In-memory cache backend.
//!
//! Entries live in an LRU map. Tag invalidation never touches the entries
//! themselves: every tag has an invalidation counter, each entry remembers the
//! sum of its tags' counters at write time, and a read whose stored sum no
//! longer matches reports the entry as stale. Only tags carried by a stored
//! entry have a counter; a tag's counter is dropped with its last entry.

use std::num::NonZeroUsize;
use std::sync::RwLock;

use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use metrics::counter;
use tracing::debug;

use super::backend::{CacheBackend, CacheItem, Lookup, unix_now};
use super::error::BackendError;
use super::index::TagIndex;
use super::lock::{rw_read, rw_write};
use super::tags::{Tag, TagSet};

const SOURCE: &str = "cache::store";

const METRIC_MEMORY_HIT: &str = "tagcache_memory_hit_total";
const METRIC_MEMORY_STALE: &str = "tagcache_memory_stale_total";
const METRIC_MEMORY_MISS: &str = "tagcache_memory_miss_total";
const METRIC_MEMORY_EVICT: &str = "tagcache_memory_evict_total";

struct StoredEntry {
    item: CacheItem,
    checksum: u64,
}

struct MemoryState {
    entries: LruCache<String, StoredEntry>,
    index: TagIndex,
}

/// LRU-bounded backend for a single bin, living in process memory.
pub struct MemoryBackend {
    bin: String,
    state: RwLock<MemoryState>,
    invalidations: DashMap<Tag, u64>,
}

impl MemoryBackend {
    pub fn new(bin: impl Into<String>, capacity: NonZeroUsize) -> Self {
        Self {
            bin: bin.into(),
            state: RwLock::new(MemoryState {
                entries: LruCache::new(capacity),
                index: TagIndex::new(),
            }),
            invalidations: DashMap::new(),
        }
    }

    pub fn bin(&self) -> &str {
        &self.bin
    }

    /// Number of physically present entries, stale ones included.
    pub fn len(&self) -> usize {
        rw_read(&self.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry along with its invalidation counters.
    pub fn clear(&self) {
        let mut state = rw_write(&self.state, SOURCE, "clear");
        state.entries.clear();
        state.index.clear();
        self.invalidations.clear();
    }

    /// Number of tags with a live invalidation counter.
    pub fn tracked_tags(&self) -> usize {
        self.invalidations.len()
    }

    fn forget(&self, orphaned: Vec<Tag>) {
        for tag in orphaned {
            self.invalidations.remove(&tag);
        }
    }

    fn checksum(&self, tags: &TagSet) -> u64 {
        tags.iter()
            .map(|tag| self.invalidations.get(tag).map_or(0, |count| *count))
            .fold(0, u64::wrapping_add)
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Lookup, BackendError> {
        let stored = rw_write(&self.state, SOURCE, "get")
            .entries
            .get(key)
            .map(|entry| (entry.item.clone(), entry.checksum));

        let Some((item, checksum)) = stored else {
            counter!(METRIC_MEMORY_MISS, "bin" => self.bin.clone()).increment(1);
            return Ok(Lookup::Absent);
        };

        if item.is_expired_at(unix_now()) || checksum != self.checksum(&item.tags) {
            counter!(METRIC_MEMORY_STALE, "bin" => self.bin.clone()).increment(1);
            return Ok(Lookup::Stale(item));
        }

        counter!(METRIC_MEMORY_HIT, "bin" => self.bin.clone()).increment(1);
        Ok(Lookup::Fresh(item))
    }

    async fn set(&self, key: &str, item: CacheItem) -> Result<(), BackendError> {
        if item.max_age.is_zero() {
            debug!(bin = %self.bin, key, "skipping write of uncacheable item");
            return Ok(());
        }

        let mut state = rw_write(&self.state, SOURCE, "set");
        let orphaned = state.index.register(key, &item.tags);
        self.forget(orphaned);
        let checksum = self.checksum(&item.tags);
        let evicted = state
            .entries
            .push(key.to_string(), StoredEntry { item, checksum });

        if let Some((evicted_key, _)) = evicted
            && evicted_key != key
        {
            let orphaned = state.index.unregister(&evicted_key);
            self.forget(orphaned);
            counter!(METRIC_MEMORY_EVICT, "bin" => self.bin.clone()).increment(1);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BackendError> {
        let mut state = rw_write(&self.state, SOURCE, "delete");
        state.entries.pop(key);
        let orphaned = state.index.unregister(key);
        self.forget(orphaned);
        Ok(())
    }

    async fn invalidate_by_tags(&self, tags: &TagSet) -> Result<(), BackendError> {
        // Held so a concurrent write cannot register a tag between the
        // index check and the bump.
        let state = rw_read(&self.state, SOURCE, "invalidate_by_tags");
        for tag in tags.iter().filter(|tag| state.index.has_tag(tag)) {
            self.invalidations
                .entry(tag.clone())
                .and_modify(|count| *count += 1)
                .or_insert(1);
        }
        Ok(())
    }

    async fn delete_tags(&self, tags: &TagSet) -> Result<(), BackendError> {
        let mut state = rw_write(&self.state, SOURCE, "delete_tags");
        let keys = state.index.keys_for_tags(tags);
        for key in &keys {
            state.entries.pop(key);
            let orphaned = state.index.unregister(key);
            self.forget(orphaned);
        }
        debug!(bin = %self.bin, removed = keys.len(), "deleted tagged entries");
        Ok(())
    }
}
