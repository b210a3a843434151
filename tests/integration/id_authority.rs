#![allow(missing_docs)]

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use kcvgraph::ids::{IdAuthority, IdAuthorityOptions, IdBlock, IdPool, SimpleBlockSizer};
use kcvgraph::primitives::bytes::StaticBuffer;
use kcvgraph::storage::backend::{EmbeddedOptions, EmbeddedStoreManager, InMemoryStoreManager};
use kcvgraph::storage::kcv::{
    Entry, EntryList, KeyColumnValueStore, KeyIterator, KeyRange, KeySelector, SliceQuery,
    StoreFeatures, StoreManager,
};
use kcvgraph::{KcvError, NamespaceId, PartitionId, Result};
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(5);

fn authority(manager: &dyn StoreManager, block: u64, bound: u64) -> Result<IdAuthority> {
    IdAuthority::open(
        manager,
        Arc::new(SimpleBlockSizer::new(block, bound)),
        IdAuthorityOptions::default().initial_backoff_ms(1).max_backoff_ms(8),
    )
}

#[test]
fn exhaustion_scenario() -> Result<()> {
    let manager = InMemoryStoreManager::new();
    let ids = authority(&manager, 10, 25)?;
    let (p, ns) = (PartitionId(0), NamespaceId(1));

    let first = ids.get_id_block(p, ns, WAIT)?;
    assert_eq!((first.start, first.end), (0, 10));
    let second = ids.get_id_block(p, ns, WAIT)?;
    assert_eq!((second.start, second.end), (10, 20));

    let third = ids.get_id_block(p, ns, WAIT);
    assert!(matches!(
        third,
        Err(KcvError::IdPoolExhausted { upper_bound: 25, .. })
    ));
    assert_eq!(ids.current_watermark(p, ns)?, 20, "failed claim moved the watermark");
    Ok(())
}

#[test]
fn sequential_blocks_are_contiguous_and_sized() -> Result<()> {
    let manager = InMemoryStoreManager::new();
    let sizer = SimpleBlockSizer::new(100, u64::MAX).with_namespace(NamespaceId(7), 3, 1_000);
    let ids = IdAuthority::open(&manager, Arc::new(sizer), IdAuthorityOptions::default())?;
    let mut expected = 0;
    for _ in 0..20 {
        let block = ids.get_id_block(PartitionId(2), NamespaceId(7), WAIT)?;
        assert_eq!(block.start, expected);
        assert_eq!(block.len(), 3);
        expected = block.end;
    }
    let other = ids.get_id_block(PartitionId(2), NamespaceId(8), WAIT)?;
    assert_eq!((other.start, other.end), (0, 100));
    let other_partition = ids.get_id_block(PartitionId(3), NamespaceId(7), WAIT)?;
    assert_eq!(other_partition.start, 0);
    Ok(())
}

#[test]
fn concurrent_authorities_never_overlap() -> Result<()> {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 25;
    let manager = Arc::new(InMemoryStoreManager::new());
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<Vec<IdBlock>> {
                // One authority per thread, as separate instances would have.
                let ids = authority(manager.as_ref(), 16, u64::MAX)?;
                barrier.wait();
                (0..PER_THREAD)
                    .map(|_| ids.get_id_block(PartitionId(0), NamespaceId(0), WAIT))
                    .collect()
            })
        })
        .collect();

    let mut blocks = Vec::new();
    for handle in handles {
        blocks.extend(handle.join().expect("worker panicked")?);
    }
    blocks.sort_by_key(|b| b.start);
    assert_eq!(blocks.len(), THREADS * PER_THREAD);
    for pair in blocks.windows(2) {
        assert!(!pair[0].overlaps(&pair[1]), "{:?} overlaps {:?}", pair[0], pair[1]);
        assert_eq!(pair[0].end, pair[1].start, "gap between blocks");
    }
    assert_eq!(blocks[0].start, 0);
    Ok(())
}

#[test]
fn watermark_survives_restart() -> Result<()> {
    let dir = tempdir()?;
    let options = EmbeddedOptions::new(dir.path());
    {
        let manager = EmbeddedStoreManager::open(&options)?;
        let ids = authority(&manager, 50, 10_000)?;
        ids.get_id_block(PartitionId(1), NamespaceId(1), WAIT)?;
        ids.get_id_block(PartitionId(1), NamespaceId(1), WAIT)?;
        ids.close();
        manager.close()?;
    }
    let manager = EmbeddedStoreManager::open(&options)?;
    let ids = authority(&manager, 50, 10_000)?;
    let block = ids.get_id_block(PartitionId(1), NamespaceId(1), WAIT)?;
    assert_eq!(block.start, 100);
    Ok(())
}

#[test]
fn closed_authority_refuses_requests() -> Result<()> {
    let manager = InMemoryStoreManager::new();
    let ids = Arc::new(authority(&manager, 4, 100)?);
    let pool = IdPool::new(Arc::clone(&ids), PartitionId(0), NamespaceId(0), WAIT);
    assert_eq!(pool.next_id()?, 0);
    ids.close();
    assert!(ids.is_closed());
    assert!(matches!(
        ids.get_id_block(PartitionId(0), NamespaceId(0), WAIT),
        Err(KcvError::Closed(_))
    ));
    // The pool drains its current block before needing the authority again.
    assert_eq!(pool.next_id()?, 1);
    assert_eq!(pool.next_id()?, 2);
    assert_eq!(pool.next_id()?, 3);
    assert!(matches!(pool.next_id(), Err(KcvError::Closed(_))));
    Ok(())
}

/// Backend whose conditional writes always lose or are not offered at all.
struct Contended {
    inner: InMemoryStoreManager,
    cas: bool,
}

struct LosingStore(Arc<dyn KeyColumnValueStore>);

impl KeyColumnValueStore for LosingStore {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn get_slice(&self, key: &StaticBuffer, query: &SliceQuery) -> Result<EntryList> {
        self.0.get_slice(key, query)
    }

    fn mutate(&self, key: &StaticBuffer, additions: &[Entry], deletions: &[StaticBuffer]) -> Result<()> {
        self.0.mutate(key, additions, deletions)
    }

    fn get_keys<'a>(
        &'a self,
        range: &KeyRange,
        query: &SliceQuery,
        selector: KeySelector,
    ) -> Result<KeyIterator<'a>> {
        self.0.get_keys(range, query, selector)
    }

    fn compare_and_swap(
        &self,
        _key: &StaticBuffer,
        _column: &StaticBuffer,
        _expected: Option<&StaticBuffer>,
        _new: &StaticBuffer,
    ) -> Result<bool> {
        Ok(false)
    }
}

impl StoreManager for Contended {
    fn name(&self) -> &str {
        "contended"
    }

    fn features(&self) -> StoreFeatures {
        StoreFeatures {
            conditional_writes: self.cas,
            ..self.inner.features()
        }
    }

    fn open_store(&self, name: &str) -> Result<Arc<dyn KeyColumnValueStore>> {
        Ok(Arc::new(LosingStore(self.inner.open_store(name)?)))
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn clear_storage(&self) -> Result<()> {
        self.inner.clear_storage()
    }
}

#[test]
fn persistent_contention_times_out() -> Result<()> {
    let manager = Contended {
        inner: InMemoryStoreManager::new(),
        cas: true,
    };
    let ids = authority(&manager, 10, 100)?;
    let err = ids
        .get_id_block(PartitionId(4), NamespaceId(2), Duration::from_millis(40))
        .unwrap_err();
    match err {
        KcvError::UniqueIdConflict {
            partition,
            namespace,
            waited_ms,
        } => {
            assert_eq!(partition, PartitionId(4));
            assert_eq!(namespace, NamespaceId(2));
            assert!(waited_ms >= 40);
        }
        other => panic!("unexpected error {other}"),
    }
    Ok(())
}

#[test]
fn backend_without_conditional_writes_is_rejected() {
    let manager = Contended {
        inner: InMemoryStoreManager::new(),
        cas: false,
    };
    assert!(matches!(
        authority(&manager, 10, 100),
        Err(KcvError::UnsupportedFeature(_))
    ));
}
