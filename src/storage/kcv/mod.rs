#![forbid(unsafe_code)]
//! The key-column-value store contract every backend adapter implements.
//!
//! Rows are keyed by a [`StaticBuffer`] and hold column-ordered entries. The
//! upper layers (write buffer, ID authority, scan jobs) only ever talk to
//! storage through [`StoreManager`] and [`KeyColumnValueStore`].

mod entry;
mod query;
mod selector;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::trace;

use crate::primitives::bytes::StaticBuffer;
use crate::types::{KcvError, Result};

pub use entry::{Entry, EntryList, KcvMutation};
pub use query::{KeyRange, KeySliceQuery, SliceQuery};
pub use selector::{KeyFilter, KeySelector};

/// Capabilities a backend advertises; the write buffer and ID authority pick
/// their strategy from these.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreFeatures {
    /// Key-range scans return keys in byte order.
    pub ordered_keys: bool,
    /// Server-side time-to-live on cells.
    pub ttl: bool,
    /// Mutations spanning several rows commit atomically.
    pub multi_row_transactions: bool,
    /// [`StoreManager::mutate_many`] is implemented natively.
    pub batch_mutation: bool,
    /// [`KeyColumnValueStore::compare_and_swap`] is supported.
    pub conditional_writes: bool,
    /// Data survives process restarts.
    pub persistent: bool,
}

/// One row returned by a key-range scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEntries {
    /// Row key.
    pub key: StaticBuffer,
    /// Entries of the row matching the scan's slice query.
    pub entries: EntryList,
}

/// Lazy sequence of rows produced by [`KeyColumnValueStore::get_keys`].
pub type KeyIterator<'a> = Box<dyn Iterator<Item = Result<KeyEntries>> + Send + 'a>;

/// Pending mutations grouped by store name, then row key.
pub type StoreMutations = BTreeMap<String, BTreeMap<StaticBuffer, KcvMutation>>;

/// A named table of rows.
pub trait KeyColumnValueStore: Send + Sync {
    /// Store name, unique within its manager.
    fn name(&self) -> &str;

    /// Entries of `key` inside the slice, ordered by column ascending.
    fn get_slice(&self, key: &StaticBuffer, query: &SliceQuery) -> Result<EntryList>;

    /// Same slice over several rows.
    fn get_slices(
        &self,
        keys: &[StaticBuffer],
        query: &SliceQuery,
    ) -> Result<Vec<(StaticBuffer, EntryList)>> {
        keys.iter()
            .map(|key| Ok((key.clone(), self.get_slice(key, query)?)))
            .collect()
    }

    /// Applies `deletions` then `additions` to one row, atomically for that row.
    fn mutate(
        &self,
        key: &StaticBuffer,
        additions: &[Entry],
        deletions: &[StaticBuffer],
    ) -> Result<()>;

    /// Rows whose key lies in `range`, accepted by `selector`, with their
    /// entries in `query`. Rows with no entries in the slice are skipped.
    /// Iteration ends once the selector reaches its limit.
    fn get_keys<'a>(
        &'a self,
        range: &KeyRange,
        query: &SliceQuery,
        selector: KeySelector,
    ) -> Result<KeyIterator<'a>>;

    /// Atomically replaces the value of `column` with `new` when its current
    /// value equals `expected` (`None` = column absent). Returns whether the
    /// write happened.
    fn compare_and_swap(
        &self,
        key: &StaticBuffer,
        column: &StaticBuffer,
        expected: Option<&StaticBuffer>,
        new: &StaticBuffer,
    ) -> Result<bool> {
        let _ = (key, column, expected, new);
        Err(KcvError::UnsupportedFeature("conditional writes"))
    }
}

/// Opens stores of one backend and applies batched mutations across them.
pub trait StoreManager: Send + Sync {
    /// Backend name used in logs.
    fn name(&self) -> &str;

    /// Advertised capabilities.
    fn features(&self) -> StoreFeatures;

    /// Opens (creating on first use) the store called `name`.
    fn open_store(&self, name: &str) -> Result<Arc<dyn KeyColumnValueStore>>;

    /// Applies all mutations. Rows are mutated one by one unless the backend
    /// overrides this; a failure is reported as [`KcvError::Persistence`] for
    /// the store being written, and earlier rows stay applied.
    fn mutate_many(&self, mutations: &StoreMutations) -> Result<()> {
        for (store_name, rows) in mutations {
            let store = self.open_store(store_name)?;
            for (key, mutation) in rows {
                trace!(store = %store_name, key = %key, ops = mutation.len(), "kcv.mutate_many.row");
                store
                    .mutate(key, &mutation.additions(), &mutation.deletions())
                    .map_err(|err| KcvError::persistence(store_name.clone(), err))?;
            }
        }
        Ok(())
    }

    /// Releases backend resources; later calls fail with [`KcvError::Closed`].
    fn close(&self) -> Result<()>;

    /// Drops every store and its data.
    fn clear_storage(&self) -> Result<()>;
}

/// Lazily walks a key range page by page, re-filtering every backend row
/// through the selector so backends need no server-side key filtering.
///
/// `fetch` returns up to `page` rows with key strictly greater than `after`
/// (or from the range start when `after` is `None`), in key order, already
/// restricted to the range and slice.
pub struct PagedKeyIterator<F> {
    fetch: F,
    selector: KeySelector,
    page_size: usize,
    buffered: std::vec::IntoIter<KeyEntries>,
    last_key: Option<StaticBuffer>,
    exhausted: bool,
}

impl<F> PagedKeyIterator<F>
where
    F: FnMut(Option<&StaticBuffer>, usize) -> Result<Vec<KeyEntries>>,
{
    /// Creates an iterator fetching `page_size` rows at a time.
    pub fn new(fetch: F, selector: KeySelector, page_size: usize) -> Self {
        Self {
            fetch,
            selector,
            page_size: page_size.max(1),
            buffered: Vec::new().into_iter(),
            last_key: None,
            exhausted: false,
        }
    }

    fn refill(&mut self) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        let page = (self.fetch)(self.last_key.as_ref(), self.page_size)?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.last_key = Some(last.key.clone());
        }
        let has_rows = !page.is_empty();
        self.buffered = page.into_iter();
        Ok(has_rows)
    }
}

impl<F> Iterator for PagedKeyIterator<F>
where
    F: FnMut(Option<&StaticBuffer>, usize) -> Result<Vec<KeyEntries>>,
{
    type Item = Result<KeyEntries>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.selector.reached_limit() {
                return None;
            }
            match self.buffered.next() {
                Some(row) => {
                    if self.selector.include(&row.key) {
                        return Some(Ok(row));
                    }
                }
                None => match self.refill() {
                    Ok(true) => continue,
                    Ok(false) => return None,
                    Err(err) => {
                        self.exhausted = true;
                        return Some(Err(err));
                    }
                },
            }
        }
    }
}
