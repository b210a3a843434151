#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kcvgraph::index::{
    Cardinality, IndexDescriptor, IndexField, IndexOptions, IndexSerializer, IndexType,
    KeyInformation, SchemaInspector, SchemaStatus, StaticSchema, EDGE_STORE, GRAPH_INDEX_STORE,
};
use kcvgraph::primitives::bytes::StaticBuffer;
use kcvgraph::primitives::codec::{AttributeValue, DataType};
use kcvgraph::scan::{
    Configuration, IndexRemoveJob, JobState, ScanOptions, StandardScanner, DELETED_RECORDS_COUNT,
    FAILED_TX, INDEX_NAME,
};
use kcvgraph::storage::backend::InMemoryStoreManager;
use kcvgraph::storage::kcv::{
    Entry, KeyColumnValueStore, KeyRange, KeySelector, SliceQuery, StoreFeatures, StoreManager,
    StoreMutations,
};
use kcvgraph::storage::{Backend, StorageOptions};
use kcvgraph::{ElementId, IndexId, KcvError, Result};

const RELATION_COLUMN: u8 = 0x20;

/// Fails the first `failures` batched writes, then behaves.
struct Flaky {
    inner: InMemoryStoreManager,
    failures: AtomicUsize,
}

impl StoreManager for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    fn features(&self) -> StoreFeatures {
        self.inner.features()
    }

    fn open_store(&self, name: &str) -> Result<Arc<dyn KeyColumnValueStore>> {
        self.inner.open_store(name)
    }

    fn mutate_many(&self, mutations: &StoreMutations) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(KcvError::Temporary("injected".into()));
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

struct Fixture {
    manager: Arc<Flaky>,
    backend: Arc<Backend>,
    schema: Arc<StaticSchema>,
    serializer: Arc<IndexSerializer>,
}

fn string_field(key: &str) -> IndexField {
    IndexField {
        key: key.into(),
        info: KeyInformation::new(DataType::String, Cardinality::Single),
    }
}

fn fixture() -> Result<Fixture> {
    let schema = Arc::new(StaticSchema::new().with_reserved_vertices(1_000..2_000));
    schema.define(
        IndexDescriptor::composite("byName", IndexId(7), vec![string_field("name")])
            .with_status(SchemaStatus::Disabled),
    );
    schema.define(
        IndexDescriptor::composite("byCity", IndexId(8), vec![string_field("city")])
            .with_status(SchemaStatus::Enabled),
    );
    let mut knows = IndexDescriptor::composite("knowsBySince", IndexId(9), Vec::new())
        .with_status(SchemaStatus::Disabled);
    knows.index_type = IndexType::RelationType {
        column_start: vec![RELATION_COLUMN],
        column_end: vec![RELATION_COLUMN + 1],
    };
    schema.define(knows);
    let mut search = IndexDescriptor::composite("search", IndexId(10), Vec::new())
        .with_status(SchemaStatus::Disabled);
    search.index_type = IndexType::Mixed {
        backing_index: "es_search".into(),
    };
    schema.define(search);

    let manager = Arc::new(Flaky {
        inner: InMemoryStoreManager::new(),
        failures: AtomicUsize::new(0),
    });
    let dyn_manager: Arc<dyn StoreManager> = Arc::clone(&manager) as Arc<dyn StoreManager>;
    let backend = Arc::new(Backend::from_manager(dyn_manager, StorageOptions::new()));
    let inspector: Arc<dyn SchemaInspector> = Arc::clone(&schema) as Arc<dyn SchemaInspector>;
    let serializer = Arc::new(IndexSerializer::new(inspector, IndexOptions::default()));
    Ok(Fixture {
        manager,
        backend,
        schema,
        serializer,
    })
}

impl Fixture {
    fn scanner(&self) -> StandardScanner {
        let manager: Arc<dyn StoreManager> = Arc::clone(&self.manager) as Arc<dyn StoreManager>;
        StandardScanner::new(
            manager,
            ScanOptions::default().workers(4).keys_per_batch(8).partitions(6),
        )
    }

    fn index_elements(&self, index: &str, count: u64) -> Result<()> {
        let descriptor = self.schema_index(index)?;
        let store = self.manager.open_store(GRAPH_INDEX_STORE)?;
        for i in 0..count {
            let value = AttributeValue::Str(format!("{index}-{i}"));
            let cell = self.serializer.index_entry(&descriptor, &[value], ElementId(i))?;
            store.mutate(&cell.key, &[cell.entry], &[])?;
        }
        Ok(())
    }

    fn schema_index(&self, name: &str) -> Result<IndexDescriptor> {
        self.schema.index(name)
    }

    fn rows(&self, store: &str) -> Result<usize> {
        let store = self.manager.open_store(store)?;
        let mut count = 0;
        for row in store.get_keys(&KeyRange::full(), &SliceQuery::full_row(), KeySelector::of(usize::MAX)?)? {
            row?;
            count += 1;
        }
        Ok(count)
    }

    fn remove(&self, index: &str) -> Arc<IndexRemoveJob> {
        Arc::new(IndexRemoveJob::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.serializer),
            index,
        ))
    }
}

#[test]
fn composite_removal_is_complete_and_idempotent() -> Result<()> {
    let fx = fixture()?;
    fx.index_elements("byName", 50)?;
    fx.index_elements("byCity", 20)?;
    let garbage = StaticBuffer::copy_from_slice(&[0x01, 0x02, 0x03]);
    fx.manager
        .open_store(GRAPH_INDEX_STORE)?
        .mutate(&garbage, &[Entry::column_only(StaticBuffer::from_u64(1))], &[])?;

    let first = fx.scanner().run(
        fx.remove("byName"),
        KeyRange::full(),
        Configuration::new(),
        Configuration::new(),
    )?;
    assert_eq!(first.state, JobState::Completed);
    assert_eq!(first.custom(DELETED_RECORDS_COUNT), 50);
    assert_eq!(first.successes, 50);
    assert_eq!(fx.rows(GRAPH_INDEX_STORE)?, 21, "other index or undecodable row touched");

    let second = fx.scanner().run(
        fx.remove("byName"),
        KeyRange::full(),
        Configuration::new(),
        Configuration::new(),
    )?;
    assert_eq!(second.state, JobState::Completed);
    assert_eq!(second.custom(DELETED_RECORDS_COUNT), 0);
    assert_eq!(second.failures, 0);
    Ok(())
}

#[test]
fn enabled_index_is_not_removed() -> Result<()> {
    let fx = fixture()?;
    fx.index_elements("byCity", 10)?;
    let err = fx
        .scanner()
        .run(
            fx.remove("byCity"),
            KeyRange::full(),
            Configuration::new(),
            Configuration::new(),
        )
        .unwrap_err();
    assert!(matches!(err, KcvError::Precondition(_)), "{err}");
    assert_eq!(fx.rows(GRAPH_INDEX_STORE)?, 10);

    fx.schema.set_status("byCity", SchemaStatus::Disabled)?;
    let report = fx.scanner().run(
        fx.remove("byCity"),
        KeyRange::full(),
        Configuration::new(),
        Configuration::new(),
    )?;
    assert_eq!(report.custom(DELETED_RECORDS_COUNT), 10);
    Ok(())
}

#[test]
fn mixed_and_unknown_indexes_are_rejected() -> Result<()> {
    let fx = fixture()?;
    let mixed = fx.scanner().start(
        fx.remove("search"),
        KeyRange::full(),
        Configuration::new(),
        Configuration::new(),
    );
    assert!(matches!(mixed, Err(KcvError::UnsupportedFeature(_))));
    let missing = fx.scanner().start(
        fx.remove("nope"),
        KeyRange::full(),
        Configuration::new(),
        Configuration::new(),
    );
    assert!(matches!(missing, Err(KcvError::NotFound(_))));
    Ok(())
}

#[test]
fn relation_index_removal_spares_reserved_vertices_and_other_columns() -> Result<()> {
    let fx = fixture()?;
    let edges = fx.manager.open_store(EDGE_STORE)?;
    let property = StaticBuffer::copy_from_slice(&[0x10]);
    let relation = |n: u8| StaticBuffer::copy_from_slice(&[RELATION_COLUMN, n]);
    for vertex in [1u64, 2, 3, 4, 1_500] {
        edges.mutate(
            &StaticBuffer::from_u64(vertex),
            &[
                Entry::column_only(property.clone()),
                Entry::column_only(relation(1)),
                Entry::column_only(relation(2)),
            ],
            &[],
        )?;
    }

    let config = Configuration::new().with(INDEX_NAME, "knowsBySince");
    let job = IndexRemoveJob::from_config(Arc::clone(&fx.backend), Arc::clone(&fx.serializer), &config)?;
    assert_eq!(job.index(), "knowsBySince");
    let report = fx.scanner().run(Arc::new(job), KeyRange::full(), config, Configuration::new())?;
    assert_eq!(report.custom(DELETED_RECORDS_COUNT), 8);

    for vertex in [1u64, 2, 3, 4] {
        let row = edges.get_slice(&StaticBuffer::from_u64(vertex), &SliceQuery::full_row())?;
        assert_eq!(row, vec![Entry::column_only(property.clone())], "vertex {vertex}");
    }
    let reserved = edges.get_slice(&StaticBuffer::from_u64(1_500), &SliceQuery::full_row())?;
    assert_eq!(reserved.len(), 3);
    Ok(())
}

#[test]
fn failed_keys_are_reported_and_a_rerun_finishes_the_job() -> Result<()> {
    let fx = fixture()?;
    fx.index_elements("byName", 30)?;
    fx.manager.failures.store(3, Ordering::SeqCst);

    let handle = fx.scanner().start(
        fx.remove("byName"),
        KeyRange::full(),
        Configuration::new(),
        Configuration::new(),
    )?;
    let report = handle.join()?;
    assert_eq!(report.state, JobState::Failed);
    assert_eq!(report.failures, 3);
    assert_eq!(report.custom(FAILED_TX), 3);
    assert_eq!(report.custom(DELETED_RECORDS_COUNT), 27);
    assert!(matches!(
        report.into_result(),
        Err(KcvError::ScanFailed { failures: 3, successes: 27, .. })
    ));

    let rerun = fx.scanner().run(
        fx.remove("byName"),
        KeyRange::full(),
        Configuration::new(),
        Configuration::new(),
    )?;
    assert_eq!(rerun.custom(DELETED_RECORDS_COUNT), 3);
    assert_eq!(fx.rows(GRAPH_INDEX_STORE)?, 0);
    Ok(())
}

#[test]
fn job_configuration_must_name_the_index() -> Result<()> {
    let fx = fixture()?;
    let missing = IndexRemoveJob::from_config(
        Arc::clone(&fx.backend),
        Arc::clone(&fx.serializer),
        &Configuration::new(),
    );
    assert!(matches!(missing, Err(KcvError::InvalidArgument(_))));
    Ok(())
}
