#![forbid(unsafe_code)]
//! Per-transaction write buffer.
//!
//! A [`BackendTransaction`] stages consolidated row mutations per store and
//! answers reads by layering them over the cached committed state. Commit
//! flushes store by store; a multi-store commit is not atomic, so when one
//! store fails the stores already flushed stay written and the error names
//! the store that failed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::primitives::bytes::StaticBuffer;
use crate::storage::cache::KcvsCache;
use crate::storage::kcv::{
    Entry, EntryList, KcvMutation, KeyColumnValueStore, SliceQuery, StoreManager, StoreMutations,
};
use crate::types::{KcvError, Result};

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// Where a transaction is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    /// Accepting reads and writes.
    Open,
    /// Flushed successfully.
    Committed,
    /// Flush failed; stores are in an indeterminate state.
    Failed,
    /// Discarded without touching the backend.
    RolledBack,
}

/// Resolves store names to their shared caches.
pub trait StoreResolver: Send + Sync {
    /// Cache-fronted handle of store `name`.
    fn store(&self, name: &str) -> Result<Arc<KcvsCache>>;
}

/// Staged mutations of one logical transaction.
///
/// Not shared between threads; each worker opens its own.
pub struct BackendTransaction {
    id: u64,
    manager: Arc<dyn StoreManager>,
    resolver: Arc<dyn StoreResolver>,
    pending: StoreMutations,
    buffer_size: usize,
    state: TxState,
}

impl BackendTransaction {
    /// Opens a transaction flushing at most `buffer_size` rows per backend call.
    pub fn new(
        manager: Arc<dyn StoreManager>,
        resolver: Arc<dyn StoreResolver>,
        buffer_size: usize,
    ) -> Self {
        let id = NEXT_TX_ID.fetch_add(1, Ordering::Relaxed);
        trace!(tx = id, "tx.begin");
        Self {
            id,
            manager,
            resolver,
            pending: StoreMutations::new(),
            buffer_size: buffer_size.max(1),
            state: TxState::Open,
        }
    }

    /// Process-unique transaction number used in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Returns true until commit or rollback.
    pub fn is_open(&self) -> bool {
        self.state == TxState::Open
    }

    /// Returns true when at least one row mutation is staged.
    pub fn has_modifications(&self) -> bool {
        self.pending
            .values()
            .any(|rows| rows.values().any(|m| !m.is_empty()))
    }

    /// Number of rows with staged mutations.
    pub fn staged_rows(&self) -> usize {
        self.pending.values().map(BTreeMap::len).sum()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state != TxState::Open {
            return Err(KcvError::Closed("backend transaction"));
        }
        Ok(())
    }

    /// Reads a slice of `key` in `store`, including this transaction's
    /// uncommitted writes.
    pub fn get_slice(
        &self,
        store: &str,
        key: &StaticBuffer,
        query: &SliceQuery,
    ) -> Result<EntryList> {
        self.ensure_open()?;
        let cache = self.resolver.store(store)?;
        let staged = self.pending.get(store).and_then(|rows| rows.get(key));
        let Some(staged) = staged else {
            return cache.get_slice(key, query);
        };
        let unbounded = SliceQuery::new(query.start().clone(), query.end().clone())?;
        let committed = cache.get_slice(key, &unbounded)?;
        Ok(overlay(committed, staged, query))
    }

    /// Stages `deletions` then `additions` on one row of `store`.
    pub fn mutate(
        &mut self,
        store: &str,
        key: &StaticBuffer,
        additions: &[Entry],
        deletions: &[StaticBuffer],
    ) -> Result<()> {
        self.ensure_open()?;
        if additions.is_empty() && deletions.is_empty() {
            return Ok(());
        }
        let incoming = KcvMutation::from_parts(additions, deletions);
        self.pending
            .entry(store.to_string())
            .or_default()
            .entry(key.clone())
            .or_default()
            .merge(incoming);
        Ok(())
    }

    /// Flushes every staged mutation and closes the transaction.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            self.state = TxState::Committed;
            trace!(tx = self.id, "tx.commit.empty");
            return Ok(());
        }
        let batch = self.manager.features().batch_mutation;
        for (store_name, rows) in pending {
            if let Err(err) = self.flush_store(&store_name, rows, batch) {
                self.state = TxState::Failed;
                warn!(tx = self.id, store = %store_name, error = %err, "tx.commit.failed");
                return Err(err);
            }
        }
        self.state = TxState::Committed;
        debug!(tx = self.id, "tx.commit");
        Ok(())
    }

    fn flush_store(
        &self,
        store_name: &str,
        rows: BTreeMap<StaticBuffer, KcvMutation>,
        batch: bool,
    ) -> Result<()> {
        let cache = self
            .resolver
            .store(store_name)
            .map_err(|err| KcvError::persistence(store_name, err))?;
        let keys: Vec<StaticBuffer> = rows.keys().cloned().collect();
        let outcome = if batch {
            self.flush_batched(store_name, rows)
        } else {
            flush_rows(&cache, store_name, &rows)
        };
        for key in &keys {
            cache.invalidate(key);
        }
        outcome
    }

    fn flush_batched(
        &self,
        store_name: &str,
        rows: BTreeMap<StaticBuffer, KcvMutation>,
    ) -> Result<()> {
        let mut chunk = BTreeMap::new();
        let mut iter = rows.into_iter().peekable();
        while let Some((key, mutation)) = iter.next() {
            chunk.insert(key, mutation);
            if chunk.len() < self.buffer_size && iter.peek().is_some() {
                continue;
            }
            trace!(tx = self.id, store = store_name, rows = chunk.len(), "tx.commit.flush");
            let mut mutations = StoreMutations::new();
            mutations.insert(store_name.to_string(), std::mem::take(&mut chunk));
            self.manager
                .mutate_many(&mutations)
                .map_err(|err| match err {
                    KcvError::Persistence { .. } => err,
                    other => KcvError::persistence(store_name, other),
                })?;
        }
        Ok(())
    }

    /// Discards every staged mutation without touching the backend.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        let dropped = self.staged_rows();
        self.pending.clear();
        self.state = TxState::RolledBack;
        debug!(tx = self.id, dropped, "tx.rollback");
        Ok(())
    }
}

fn flush_rows(
    cache: &KcvsCache,
    store_name: &str,
    rows: &BTreeMap<StaticBuffer, KcvMutation>,
) -> Result<()> {
    for (key, mutation) in rows {
        trace!(store = store_name, key = %key, "tx.commit.flush_row");
        cache
            .inner()
            .mutate(key, &mutation.additions(), &mutation.deletions())
            .map_err(|err| KcvError::persistence(store_name, err))?;
    }
    Ok(())
}

/// Layers `staged` over `committed` entries and re-applies the slice bounds.
fn overlay(committed: EntryList, staged: &KcvMutation, query: &SliceQuery) -> EntryList {
    let mut merged: BTreeMap<StaticBuffer, StaticBuffer> = committed
        .into_iter()
        .map(|e| (e.column, e.value))
        .collect();
    for column in staged.iter_deletions() {
        merged.remove(column);
    }
    for (column, value) in staged.iter_additions() {
        if query.contains(column) {
            merged.insert(column.clone(), value.clone());
        }
    }
    query.apply(merged.into_iter().map(|(c, v)| Entry::new(c, v)))
}

/// Resolver caching one [`KcvsCache`] per store.
pub struct CachedStores {
    manager: Arc<dyn StoreManager>,
    capacity: usize,
    caches: parking_lot::RwLock<FxHashMap<String, Arc<KcvsCache>>>,
}

impl CachedStores {
    /// Resolver over `manager` with `capacity` slices per store cache.
    pub fn new(manager: Arc<dyn StoreManager>, capacity: usize) -> Self {
        Self {
            manager,
            capacity,
            caches: parking_lot::RwLock::new(FxHashMap::default()),
        }
    }

    /// Forgets every store handle and its cached slices.
    pub fn clear(&self) {
        let mut caches = self.caches.write();
        for cache in caches.values() {
            cache.clear();
        }
        caches.clear();
    }
}

impl StoreResolver for CachedStores {
    fn store(&self, name: &str) -> Result<Arc<KcvsCache>> {
        if let Some(cache) = self.caches.read().get(name) {
            return Ok(Arc::clone(cache));
        }
        let store = self.manager.open_store(name)?;
        let mut caches = self.caches.write();
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(KcvsCache::new(store, self.capacity)));
        Ok(Arc::clone(cache))
    }
}
