use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::primitives::bytes::StaticBuffer;
use crate::storage::kcv::{
    Entry, EntryList, KeyColumnValueStore, KeyEntries, KeyIterator, KeyRange, KeySelector,
    PagedKeyIterator, SliceQuery, StoreFeatures, StoreManager, StoreMutations,
};
use crate::types::{KcvError, Result};

const SCAN_PAGE_ROWS: usize = 256;

pub(crate) type Row = BTreeMap<StaticBuffer, StaticBuffer>;
pub(crate) type Table = BTreeMap<StaticBuffer, Row>;

/// Reads `query` out of one row.
pub(crate) fn slice_row(row: &Row, query: &SliceQuery) -> EntryList {
    let cap = query.limit().unwrap_or(usize::MAX);
    row.range::<StaticBuffer, _>((
        Bound::Included(query.start()),
        Bound::Excluded(query.end()),
    ))
    .take(cap)
    .map(|(c, v)| Entry::new(c.clone(), v.clone()))
    .collect()
}

/// Applies deletions then additions to one row of `table`, dropping the row
/// when it ends up empty.
pub(crate) fn apply_row(
    table: &mut Table,
    key: &StaticBuffer,
    additions: &[Entry],
    deletions: &[StaticBuffer],
) {
    let row = table.entry(key.clone()).or_default();
    for column in deletions {
        row.remove(column);
    }
    for entry in additions {
        row.insert(entry.column.clone(), entry.value.clone());
    }
    if row.is_empty() {
        table.remove(key);
    }
}

/// Collects one page of `get_keys` output from `table`.
pub(crate) fn scan_page(
    table: &Table,
    range: &KeyRange,
    query: &SliceQuery,
    after: Option<&StaticBuffer>,
    page: usize,
) -> Vec<KeyEntries> {
    let lower = match after {
        Some(after) if after >= range.start() => Bound::Excluded(after),
        _ => Bound::Included(range.start()),
    };
    let upper = match range.end() {
        Some(end) => Bound::Excluded(end),
        None => Bound::Unbounded,
    };
    if range.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(page.min(64));
    for (key, row) in table.range::<StaticBuffer, _>((lower, upper)) {
        if out.len() >= page {
            break;
        }
        let entries = slice_row(row, query);
        if entries.is_empty() {
            continue;
        }
        out.push(KeyEntries {
            key: key.clone(),
            entries,
        });
    }
    out
}

/// Compare-and-swap on one cell of `table`.
pub(crate) fn cas_cell(
    table: &Table,
    key: &StaticBuffer,
    column: &StaticBuffer,
    expected: Option<&StaticBuffer>,
) -> bool {
    let current = table.get(key).and_then(|row| row.get(column));
    current == expected
}

/// Store held entirely in memory; used by tests and as the embedded adapter's
/// working set.
pub struct InMemoryStore {
    name: String,
    table: RwLock<Table>,
    closed: Arc<AtomicBool>,
}

impl InMemoryStore {
    fn new(name: &str, closed: Arc<AtomicBool>) -> Self {
        Self {
            name: name.to_string(),
            table: RwLock::new(Table::new()),
            closed,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KcvError::Closed("in-memory store manager"));
        }
        Ok(())
    }

    /// Number of non-empty rows.
    pub fn row_count(&self) -> usize {
        self.table.read().len()
    }

    fn apply_batch(&self, rows: &BTreeMap<StaticBuffer, crate::storage::kcv::KcvMutation>) {
        let mut table = self.table.write();
        for (key, mutation) in rows {
            apply_row(&mut table, key, &mutation.additions(), &mutation.deletions());
        }
    }
}

impl KeyColumnValueStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_slice(&self, key: &StaticBuffer, query: &SliceQuery) -> Result<EntryList> {
        self.ensure_open()?;
        let table = self.table.read();
        Ok(table
            .get(key)
            .map(|row| slice_row(row, query))
            .unwrap_or_default())
    }

    fn mutate(
        &self,
        key: &StaticBuffer,
        additions: &[Entry],
        deletions: &[StaticBuffer],
    ) -> Result<()> {
        self.ensure_open()?;
        let mut table = self.table.write();
        apply_row(&mut table, key, additions, deletions);
        Ok(())
    }

    fn get_keys<'a>(
        &'a self,
        range: &KeyRange,
        query: &SliceQuery,
        selector: KeySelector,
    ) -> Result<KeyIterator<'a>> {
        self.ensure_open()?;
        let range = range.clone();
        let query = query.clone();
        let fetch = move |after: Option<&StaticBuffer>, page: usize| {
            self.ensure_open()?;
            let table = self.table.read();
            Ok(scan_page(&table, &range, &query, after, page))
        };
        Ok(Box::new(PagedKeyIterator::new(
            fetch,
            selector,
            SCAN_PAGE_ROWS,
        )))
    }

    fn compare_and_swap(
        &self,
        key: &StaticBuffer,
        column: &StaticBuffer,
        expected: Option<&StaticBuffer>,
        new: &StaticBuffer,
    ) -> Result<bool> {
        self.ensure_open()?;
        let mut table = self.table.write();
        if !cas_cell(&table, key, column, expected) {
            return Ok(false);
        }
        apply_row(
            &mut table,
            key,
            &[Entry::new(column.clone(), new.clone())],
            &[],
        );
        Ok(true)
    }
}

/// Backend keeping every store in process memory.
pub struct InMemoryStoreManager {
    stores: RwLock<FxHashMap<String, Arc<InMemoryStore>>>,
    closed: Arc<AtomicBool>,
}

impl Default for InMemoryStoreManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStoreManager {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self {
            stores: RwLock::new(FxHashMap::default()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn store(&self, name: &str) -> Result<Arc<InMemoryStore>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KcvError::Closed("in-memory store manager"));
        }
        if let Some(store) = self.stores.read().get(name) {
            return Ok(Arc::clone(store));
        }
        let mut stores = self.stores.write();
        let store = stores
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(store = name, "kcv.memory.open_store");
                Arc::new(InMemoryStore::new(name, Arc::clone(&self.closed)))
            })
            .clone();
        Ok(store)
    }
}

impl StoreManager for InMemoryStoreManager {
    fn name(&self) -> &str {
        "inmemory"
    }

    fn features(&self) -> StoreFeatures {
        StoreFeatures {
            ordered_keys: true,
            ttl: false,
            multi_row_transactions: false,
            batch_mutation: true,
            conditional_writes: true,
            persistent: false,
        }
    }

    fn open_store(&self, name: &str) -> Result<Arc<dyn KeyColumnValueStore>> {
        let store: Arc<dyn KeyColumnValueStore> = self.store(name)?;
        Ok(store)
    }

    fn mutate_many(&self, mutations: &StoreMutations) -> Result<()> {
        for (store_name, rows) in mutations {
            let store = self
                .store(store_name)
                .map_err(|err| KcvError::persistence(store_name.clone(), err))?;
            store.apply_batch(rows);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn clear_storage(&self) -> Result<()> {
        let mut stores = self.stores.write();
        for store in stores.values() {
            store.table.write().clear();
        }
        stores.clear();
        Ok(())
    }
}
