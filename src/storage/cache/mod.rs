#![forbid(unsafe_code)]

use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::trace;

use crate::primitives::bytes::StaticBuffer;
use crate::storage::kcv::{
    Entry, EntryList, KeyColumnValueStore, KeyIterator, KeyRange, KeySelector, KeySliceQuery,
    SliceQuery,
};
use crate::types::Result;

/// Empty additions half of a pure-deletion mutation.
pub const NO_ADDITIONS: &[Entry] = &[];

/// Empty deletions half of a pure-addition mutation.
pub const NO_DELETIONS: &[StaticBuffer] = &[];

/// Point-in-time cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Slice reads answered from the cache.
    pub hits: u64,
    /// Slice reads forwarded to the store.
    pub misses: u64,
    /// Cached slices dropped because their row was written.
    pub invalidations: u64,
}

const EPOCH_STRIPES: usize = 64;

/// LRU contents plus per-stripe write epochs.
///
/// A fill is only stored when its row's stripe epoch did not move while the
/// store was being read, so a write racing a miss can never leave the old
/// slice behind.
struct SliceTable {
    lru: LruCache<KeySliceQuery, EntryList>,
    epochs: [u64; EPOCH_STRIPES],
}

fn stripe(key: &StaticBuffer) -> usize {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % EPOCH_STRIPES
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

/// Read-through LRU cache of row slices in front of one store.
///
/// Writes issued through the cache invalidate every cached slice of the
/// written row. Key-range scans are never cached.
pub struct KcvsCache {
    store: Arc<dyn KeyColumnValueStore>,
    slices: Option<Mutex<SliceTable>>,
    counters: CacheCounters,
}

impl KcvsCache {
    /// Wraps `store`, keeping up to `capacity` slices (0 disables caching).
    pub fn new(store: Arc<dyn KeyColumnValueStore>, capacity: usize) -> Self {
        Self {
            store,
            slices: NonZeroUsize::new(capacity).map(|cap| {
                Mutex::new(SliceTable {
                    lru: LruCache::new(cap),
                    epochs: [0; EPOCH_STRIPES],
                })
            }),
            counters: CacheCounters::default(),
        }
    }

    /// Underlying store.
    pub fn inner(&self) -> &Arc<dyn KeyColumnValueStore> {
        &self.store
    }

    /// Drops every cached slice of `key`.
    pub fn invalidate(&self, key: &StaticBuffer) {
        let Some(slices) = &self.slices else {
            return;
        };
        let mut guard = slices.lock();
        guard.epochs[stripe(key)] += 1;
        let stale: SmallVec<[KeySliceQuery; 4]> = guard
            .lru
            .iter()
            .filter(|(cached, _)| cached.key == *key)
            .map(|(cached, _)| cached.clone())
            .collect();
        for cached in &stale {
            guard.lru.pop(cached);
        }
        if !stale.is_empty() {
            self.counters
                .invalidations
                .fetch_add(stale.len() as u64, Ordering::Relaxed);
            trace!(store = self.store.name(), key = %key, dropped = stale.len(), "kcv.cache.invalidate");
        }
    }

    /// Empties the cache.
    pub fn clear(&self) {
        if let Some(slices) = &self.slices {
            let mut guard = slices.lock();
            guard.lru.clear();
            for epoch in guard.epochs.iter_mut() {
                *epoch += 1;
            }
        }
    }

    /// Number of cached slices.
    pub fn len(&self) -> usize {
        self.slices.as_ref().map_or(0, |s| s.lock().lru.len())
    }

    /// Returns true when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the hit/miss counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }
}

impl KeyColumnValueStore for KcvsCache {
    fn name(&self) -> &str {
        self.store.name()
    }

    fn get_slice(&self, key: &StaticBuffer, query: &SliceQuery) -> Result<EntryList> {
        let Some(slices) = &self.slices else {
            return self.store.get_slice(key, query);
        };
        let cache_key = KeySliceQuery::new(key.clone(), query.clone());
        let stripe = stripe(key);
        let epoch = {
            let mut guard = slices.lock();
            if let Some(hit) = guard.lru.get(&cache_key) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(hit.clone());
            }
            guard.epochs[stripe]
        };
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let entries = self.store.get_slice(key, query)?;
        let mut guard = slices.lock();
        if guard.epochs[stripe] == epoch {
            guard.lru.put(cache_key, entries.clone());
        } else {
            trace!(store = self.store.name(), key = %key, "kcv.cache.stale_fill");
        }
        Ok(entries)
    }

    fn mutate(
        &self,
        key: &StaticBuffer,
        additions: &[Entry],
        deletions: &[StaticBuffer],
    ) -> Result<()> {
        let outcome = self.store.mutate(key, additions, deletions);
        self.invalidate(key);
        outcome
    }

    fn get_keys<'a>(
        &'a self,
        range: &KeyRange,
        query: &SliceQuery,
        selector: KeySelector,
    ) -> Result<KeyIterator<'a>> {
        self.store.get_keys(range, query, selector)
    }

    fn compare_and_swap(
        &self,
        key: &StaticBuffer,
        column: &StaticBuffer,
        expected: Option<&StaticBuffer>,
        new: &StaticBuffer,
    ) -> Result<bool> {
        let outcome = self.store.compare_and_swap(key, column, expected, new);
        self.invalidate(key);
        outcome
    }
}
