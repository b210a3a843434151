#![allow(missing_docs)]

use std::sync::Arc;

use kcvgraph::index::{
    Cardinality, IndexDescriptor, IndexField, IndexOptions, IndexSerializer, KeyInformation,
    SchemaInspector, SchemaStatus, StaticSchema, EDGE_STORE, GRAPH_INDEX_STORE,
};
use kcvgraph::primitives::bytes::StaticBuffer;
use kcvgraph::primitives::codec::{AttributeValue, DataType};
use kcvgraph::scan::{
    Configuration, IndexEntryExtractor, IndexRepairJob, JobState, ScanOptions, StandardScanner,
    ADDED_RECORDS_COUNT, INDEX_NAME,
};
use kcvgraph::storage::backend::InMemoryStoreManager;
use kcvgraph::storage::kcv::{
    Entry, EntryList, KeyColumnValueStore, KeyRange, KeySelector, SliceQuery, StoreManager,
};
use kcvgraph::storage::{Backend, StorageOptions};
use kcvgraph::{ElementId, IndexId, KcvError, Result};

const NAME_COLUMN: &[u8] = &[0x10];

/// Reads the `name` property straight out of the vertex row.
struct NameExtractor;

impl IndexEntryExtractor for NameExtractor {
    fn extract(
        &self,
        _index: &IndexDescriptor,
        _element: ElementId,
        row: &EntryList,
    ) -> Result<Vec<Vec<AttributeValue>>> {
        row.iter()
            .filter(|e| e.column.as_slice() == NAME_COLUMN)
            .map(|e| {
                let name = std::str::from_utf8(e.value.as_slice())
                    .map_err(|_| KcvError::InvalidValue("name is not utf-8".into()))?;
                Ok(vec![AttributeValue::Str(name.to_string())])
            })
            .collect()
    }
}

struct Fixture {
    manager: Arc<InMemoryStoreManager>,
    backend: Arc<Backend>,
    schema: Arc<StaticSchema>,
    serializer: Arc<IndexSerializer>,
}

fn fixture(status: SchemaStatus) -> Fixture {
    let schema = Arc::new(StaticSchema::new().with_reserved_vertices(1_000..2_000));
    let field = IndexField {
        key: "name".into(),
        info: KeyInformation::new(DataType::String, Cardinality::Single),
    };
    schema.define(IndexDescriptor::composite("byName", IndexId(7), vec![field]).with_status(status));
    let manager = Arc::new(InMemoryStoreManager::new());
    let dyn_manager: Arc<dyn StoreManager> = Arc::clone(&manager) as Arc<dyn StoreManager>;
    let backend = Arc::new(Backend::from_manager(dyn_manager, StorageOptions::new()));
    let inspector: Arc<dyn SchemaInspector> = Arc::clone(&schema) as Arc<dyn SchemaInspector>;
    let serializer = Arc::new(IndexSerializer::new(inspector, IndexOptions::default()));
    Fixture {
        manager,
        backend,
        schema,
        serializer,
    }
}

impl Fixture {
    fn add_vertex(&self, id: u64, name: Option<&str>) -> Result<()> {
        let mut cells = vec![Entry::column_only(StaticBuffer::copy_from_slice(&[0x01]))];
        if let Some(name) = name {
            cells.push(Entry::new(
                StaticBuffer::from_static(NAME_COLUMN),
                StaticBuffer::from(name),
            ));
        }
        self.manager
            .open_store(EDGE_STORE)?
            .mutate(&StaticBuffer::from_u64(id), &cells, &[])
    }

    fn repair(&self) -> Arc<IndexRepairJob> {
        Arc::new(IndexRepairJob::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.serializer),
            Arc::new(NameExtractor),
            "byName",
        ))
    }

    fn scanner(&self) -> StandardScanner {
        let manager: Arc<dyn StoreManager> = Arc::clone(&self.manager) as Arc<dyn StoreManager>;
        StandardScanner::new(manager, ScanOptions::default().workers(3).keys_per_batch(5))
    }

    fn lookup(&self, name: &str) -> Result<Vec<ElementId>> {
        let index = self.schema.index("byName")?;
        let query = self
            .serializer
            .lookup_query(&index, &[AttributeValue::Str(name.into())])?;
        let store = self.manager.open_store(GRAPH_INDEX_STORE)?;
        store
            .get_slice(&query.key, &query.slice)?
            .iter()
            .map(|entry| self.serializer.element_from_entry(&index, entry))
            .collect()
    }

    fn index_rows(&self) -> Result<usize> {
        let store = self.manager.open_store(GRAPH_INDEX_STORE)?;
        let rows = store.get_keys(&KeyRange::full(), &SliceQuery::full_row(), KeySelector::of(usize::MAX)?)?;
        Ok(rows.count())
    }
}

#[test]
fn rebuild_indexes_every_visible_vertex() -> Result<()> {
    let fx = fixture(SchemaStatus::Registered);
    for id in 0..30u64 {
        let name = (id % 3 != 0).then(|| format!("v{}", id % 10));
        fx.add_vertex(id, name.as_deref())?;
    }
    fx.add_vertex(1_500, Some("v1"))?;

    let report = fx.scanner().run(
        fx.repair(),
        KeyRange::full(),
        Configuration::new(),
        Configuration::new(),
    )?;
    assert_eq!(report.state, JobState::Completed);
    assert_eq!(report.custom(ADDED_RECORDS_COUNT), 20);
    assert_eq!(report.successes, 30);

    let mut v1 = fx.lookup("v1")?;
    v1.sort();
    assert_eq!(v1, vec![ElementId(1), ElementId(11)], "reserved vertex 1500 must not be indexed");
    let mut v0 = fx.lookup("v0")?;
    v0.sort();
    assert_eq!(v0, vec![ElementId(10), ElementId(20)]);
    Ok(())
}

#[test]
fn rerunning_a_rebuild_changes_nothing() -> Result<()> {
    let fx = fixture(SchemaStatus::Enabled);
    for id in 0..12u64 {
        fx.add_vertex(id, Some(&format!("n{id}")))?;
    }
    let config = Configuration::new().with(INDEX_NAME, "byName");
    let job = |fx: &Fixture| {
        IndexRepairJob::from_config(
            Arc::clone(&fx.backend),
            Arc::clone(&fx.serializer),
            Arc::new(NameExtractor),
            &config,
        )
        .map(Arc::new)
    };
    fx.scanner().run(job(&fx)?, KeyRange::full(), config.clone(), Configuration::new())?;
    let before = fx.index_rows()?;
    let again = fx.scanner().run(job(&fx)?, KeyRange::full(), config.clone(), Configuration::new())?;
    assert_eq!(again.state, JobState::Completed);
    assert_eq!(fx.index_rows()?, before);
    assert_eq!(before, 12);
    assert_eq!(fx.lookup("n4")?, vec![ElementId(4)]);
    Ok(())
}

#[test]
fn rebuild_requires_a_live_composite_index() {
    for status in [SchemaStatus::Installed, SchemaStatus::Disabled] {
        let fx = fixture(status);
        let started = fx.scanner().start(
            fx.repair(),
            KeyRange::full(),
            Configuration::new(),
            Configuration::new(),
        );
        assert!(matches!(started, Err(KcvError::Precondition(_))), "{status}");
    }
}
