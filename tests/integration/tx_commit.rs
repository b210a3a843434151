#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kcvgraph::primitives::bytes::StaticBuffer;
use kcvgraph::storage::backend::InMemoryStoreManager;
use kcvgraph::storage::kcv::{
    Entry, EntryList, KeyColumnValueStore, KeyIterator, KeyRange, KeySelector, SliceQuery,
    StoreFeatures, StoreManager, StoreMutations,
};
use kcvgraph::storage::{Backend, StorageOptions, TxState, NO_ADDITIONS};
use kcvgraph::{KcvError, Result};

/// Counts backend calls and fails every write to one store.
struct Instrumented {
    inner: InMemoryStoreManager,
    batch: bool,
    fail_store: Option<&'static str>,
    row_writes: Arc<AtomicUsize>,
    batch_writes: AtomicUsize,
}

impl Instrumented {
    fn new(batch: bool, fail_store: Option<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStoreManager::new(),
            batch,
            fail_store,
            row_writes: Arc::new(AtomicUsize::new(0)),
            batch_writes: AtomicUsize::new(0),
        })
    }

    fn backend_calls(&self) -> usize {
        self.row_writes.load(Ordering::SeqCst) + self.batch_writes.load(Ordering::SeqCst)
    }
}

struct InstrumentedStore {
    inner: Arc<dyn KeyColumnValueStore>,
    fail: bool,
    row_writes: Arc<AtomicUsize>,
}

impl KeyColumnValueStore for InstrumentedStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get_slice(&self, key: &StaticBuffer, query: &SliceQuery) -> Result<EntryList> {
        self.inner.get_slice(key, query)
    }

    fn mutate(&self, key: &StaticBuffer, additions: &[Entry], deletions: &[StaticBuffer]) -> Result<()> {
        self.row_writes.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(KcvError::Temporary("injected write failure".into()));
        }
        self.inner.mutate(key, additions, deletions)
    }

    fn get_keys<'a>(
        &'a self,
        range: &KeyRange,
        query: &SliceQuery,
        selector: KeySelector,
    ) -> Result<KeyIterator<'a>> {
        self.inner.get_keys(range, query, selector)
    }
}

impl StoreManager for Instrumented {
    fn name(&self) -> &str {
        "instrumented"
    }

    fn features(&self) -> StoreFeatures {
        StoreFeatures {
            batch_mutation: self.batch,
            ..self.inner.features()
        }
    }

    fn open_store(&self, name: &str) -> Result<Arc<dyn KeyColumnValueStore>> {
        Ok(Arc::new(InstrumentedStore {
            inner: self.inner.open_store(name)?,
            fail: self.fail_store == Some(name),
            row_writes: Arc::clone(&self.row_writes),
        }))
    }

    fn mutate_many(&self, mutations: &StoreMutations) -> Result<()> {
        self.batch_writes.fetch_add(1, Ordering::SeqCst);
        if let Some(store) = self.fail_store {
            if mutations.contains_key(store) {
                return Err(KcvError::Temporary("injected batch failure".into()));
            }
        }
        self.inner.mutate_many(mutations)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn clear_storage(&self) -> Result<()> {
        self.inner.clear_storage()
    }
}

fn key(i: u64) -> StaticBuffer {
    StaticBuffer::from_u64(i)
}

fn col(c: &[u8], v: &[u8]) -> Entry {
    Entry::new(StaticBuffer::copy_from_slice(c), StaticBuffer::copy_from_slice(v))
}

fn backend(manager: &Arc<Instrumented>, buffer_size: usize) -> Backend {
    let manager: Arc<dyn StoreManager> = Arc::clone(manager) as Arc<dyn StoreManager>;
    Backend::from_manager(manager, StorageOptions::new().buffer_size(buffer_size))
}

#[test]
fn reads_see_own_uncommitted_writes() -> Result<()> {
    let manager = Instrumented::new(true, None);
    let backend = backend(&manager, 16);
    backend
        .store("edgestore")?
        .mutate(&key(1), &[col(b"a", b"1"), col(b"b", b"2"), col(b"c", b"3")], &[])?;

    let mut tx = backend.begin();
    tx.mutate("edgestore", &key(1), &[col(b"aa", b"x")], &[StaticBuffer::from("b")])?;
    let row = tx.get_slice("edgestore", &key(1), &SliceQuery::full_row())?;
    assert_eq!(row, vec![col(b"a", b"1"), col(b"aa", b"x"), col(b"c", b"3")]);

    let capped = SliceQuery::full_row().with_limit(2)?;
    assert_eq!(
        tx.get_slice("edgestore", &key(1), &capped)?,
        vec![col(b"a", b"1"), col(b"aa", b"x")]
    );

    let outside = tx.get_slice("edgestore", &key(2), &SliceQuery::full_row())?;
    assert!(outside.is_empty());
    assert_eq!(manager.batch_writes.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn rollback_never_reaches_the_backend() -> Result<()> {
    let manager = Instrumented::new(true, None);
    let backend = backend(&manager, 16);
    let mut tx = backend.begin();
    for i in 0..5 {
        tx.mutate("graphindex", &key(i), &[col(b"c", b"v")], &[])?;
    }
    assert!(tx.has_modifications());
    tx.rollback()?;
    assert_eq!(tx.state(), TxState::RolledBack);
    assert_eq!(manager.backend_calls(), 0);
    let store = backend.store("graphindex")?;
    assert!(store.get_slice(&key(0), &SliceQuery::full_row())?.is_empty());
    assert!(matches!(tx.commit(), Err(KcvError::Closed(_))));
    Ok(())
}

#[test]
fn batched_commit_flushes_in_buffer_sized_chunks() -> Result<()> {
    let manager = Instrumented::new(true, None);
    let backend = backend(&manager, 3);
    let mut tx = backend.begin();
    for i in 0..10 {
        tx.mutate("graphindex", &key(i), &[col(b"c", b"v")], &[])?;
    }
    tx.commit()?;
    assert_eq!(tx.state(), TxState::Committed);
    assert_eq!(manager.batch_writes.load(Ordering::SeqCst), 4);
    assert_eq!(manager.row_writes.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn per_row_commit_without_batch_support() -> Result<()> {
    let manager = Instrumented::new(false, None);
    let backend = backend(&manager, 3);
    let mut tx = backend.begin();
    for i in 0..4 {
        tx.mutate("graphindex", &key(i), &[col(b"c", b"v")], &[])?;
    }
    tx.commit()?;
    assert_eq!(manager.row_writes.load(Ordering::SeqCst), 4);
    assert_eq!(manager.batch_writes.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn failed_flush_names_the_store_and_keeps_earlier_stores() -> Result<()> {
    for batch in [true, false] {
        let manager = Instrumented::new(batch, Some("graphindex"));
        let backend = backend(&manager, 8);
        let mut tx = backend.begin();
        tx.mutate("edgestore", &key(1), &[col(b"e", b"1")], &[])?;
        tx.mutate("graphindex", &key(1), &[col(b"i", b"1")], &[])?;

        match tx.commit() {
            Err(KcvError::Persistence { store, source }) => {
                assert_eq!(store, "graphindex");
                assert!(source.is_retryable());
            }
            other => panic!("expected persistence failure, got {other:?}"),
        }
        assert_eq!(tx.state(), TxState::Failed);
        assert!(matches!(
            tx.mutate("edgestore", &key(2), NO_ADDITIONS, &[]),
            Err(KcvError::Closed(_))
        ));

        // Cross-store commit is best effort: the first store stays written.
        let edges = backend.store("edgestore")?;
        assert_eq!(edges.get_slice(&key(1), &SliceQuery::full_row())?.len(), 1);
    }
    Ok(())
}

#[test]
fn commit_invalidates_cached_reads() -> Result<()> {
    let manager = Instrumented::new(true, None);
    let backend = backend(&manager, 8);
    let store = backend.store("edgestore")?;
    assert!(store.get_slice(&key(9), &SliceQuery::full_row())?.is_empty());
    assert!(store.get_slice(&key(9), &SliceQuery::full_row())?.is_empty());
    assert_eq!(store.stats().hits, 1);

    let mut tx = backend.begin();
    tx.mutate("edgestore", &key(9), &[col(b"c", b"v")], &[])?;
    tx.commit()?;
    assert_eq!(store.get_slice(&key(9), &SliceQuery::full_row())?, vec![col(b"c", b"v")]);
    Ok(())
}
