use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::index::{IndexDescriptor, IndexSerializer, SchemaStatus};
use crate::primitives::bytes::StaticBuffer;
use crate::primitives::codec::AttributeValue;
use crate::storage::kcv::{EntryList, KeyFilter, SliceQuery};
use crate::storage::{Backend, NO_DELETIONS};
use crate::types::{ElementId, KcvError, Result};

use super::{
    in_transaction, Configuration, ScanJob, ScanJobFactory, ScanMetrics, ADDED_RECORDS_COUNT,
    INDEX_NAME,
};

/// Graph-layer hook reading the indexed values out of an element row.
pub trait IndexEntryExtractor: Send + Sync {
    /// Value combinations `element` holds for the fields of `index`, one
    /// `Vec` per combination in field order. Empty when the element is not
    /// covered by the index.
    fn extract(
        &self,
        index: &IndexDescriptor,
        element: ElementId,
        row: &EntryList,
    ) -> Result<Vec<Vec<AttributeValue>>>;
}

/// (Re)builds a composite index from the element rows of the graph store.
///
/// Writing an entry that already exists is a no-op, so the job can be rerun
/// after partial failures.
pub struct IndexRepairJob {
    backend: Arc<Backend>,
    serializer: Arc<IndexSerializer>,
    extractor: Arc<dyn IndexEntryExtractor>,
    index: String,
}

impl IndexRepairJob {
    /// Job rebuilding index `index`.
    pub fn new(
        backend: Arc<Backend>,
        serializer: Arc<IndexSerializer>,
        extractor: Arc<dyn IndexEntryExtractor>,
        index: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            serializer,
            extractor,
            index: index.into(),
        }
    }

    /// Job rebuilding the index named by the [`INDEX_NAME`] entry of `config`.
    pub fn from_config(
        backend: Arc<Backend>,
        serializer: Arc<IndexSerializer>,
        extractor: Arc<dyn IndexEntryExtractor>,
        config: &Configuration,
    ) -> Result<Self> {
        let index = config
            .get_str(INDEX_NAME)
            .ok_or_else(|| KcvError::invalid(format!("job configuration lacks `{INDEX_NAME}`")))?;
        Ok(Self::new(backend, serializer, extractor, index))
    }
}

fn resolve(serializer: &IndexSerializer, name: &str) -> Result<IndexDescriptor> {
    let descriptor = serializer.schema().index(name)?;
    if !descriptor.is_composite() {
        return Err(KcvError::UnsupportedFeature(
            "rebuilding indexes other than composite ones",
        ));
    }
    match descriptor.status {
        SchemaStatus::Registered | SchemaStatus::Enabled => Ok(descriptor),
        status => Err(KcvError::Precondition(format!(
            "index `{name}` must be registered or enabled to be rebuilt, found {status}"
        ))),
    }
}

impl ScanJobFactory for IndexRepairJob {
    fn name(&self) -> String {
        format!("index-repair:{}", self.index)
    }

    fn validate(&self) -> Result<String> {
        resolve(&self.serializer, &self.index)?;
        Ok(self.serializer.options().edge_store.clone())
    }

    fn create(&self) -> Result<Box<dyn ScanJob>> {
        Ok(Box::new(RepairWorker {
            backend: Arc::clone(&self.backend),
            serializer: Arc::clone(&self.serializer),
            extractor: Arc::clone(&self.extractor),
            index: self.index.clone(),
            descriptor: None,
        }))
    }
}

struct RepairWorker {
    backend: Arc<Backend>,
    serializer: Arc<IndexSerializer>,
    extractor: Arc<dyn IndexEntryExtractor>,
    index: String,
    descriptor: Option<IndexDescriptor>,
}

impl ScanJob for RepairWorker {
    fn worker_iteration_start(
        &mut self,
        _job_config: &Configuration,
        _graph_config: &Configuration,
        _metrics: &ScanMetrics,
    ) -> Result<()> {
        self.descriptor = Some(resolve(&self.serializer, &self.index)?);
        debug!(index = %self.index, "scan.index_repair.worker_start");
        Ok(())
    }

    fn worker_iteration_end(&mut self, metrics: &ScanMetrics) -> Result<()> {
        if self.descriptor.take().is_some() {
            info!(
                index = %self.index,
                adds = metrics.get_custom(ADDED_RECORDS_COUNT),
                "scan.index_repair.worker_end"
            );
        }
        Ok(())
    }

    fn queries(&self) -> Vec<SliceQuery> {
        vec![SliceQuery::full_row()]
    }

    fn key_filter(&self) -> KeyFilter {
        let schema = Arc::clone(self.serializer.schema());
        Arc::new(move |key: &StaticBuffer| match key.as_u64() {
            Ok(element) => !schema.is_reserved_vertex(ElementId(element)),
            Err(err) => {
                warn!(key = %key, error = %err, "scan.index_repair.undecodable_key");
                false
            }
        })
    }

    fn process(
        &mut self,
        key: &StaticBuffer,
        entries: &HashMap<SliceQuery, EntryList>,
        metrics: &ScanMetrics,
    ) -> Result<()> {
        let descriptor = self
            .descriptor
            .as_ref()
            .ok_or(KcvError::Closed("index repair worker"))?;
        let element = ElementId(key.as_u64()?);
        let empty = EntryList::new();
        let row = entries.get(&SliceQuery::full_row()).unwrap_or(&empty);
        let combinations = self.extractor.extract(descriptor, element, row)?;
        if combinations.is_empty() {
            return Ok(());
        }
        let cells = combinations
            .iter()
            .map(|values| self.serializer.index_entry(descriptor, values, element))
            .collect::<Result<Vec<_>>>()?;
        let store = &self.serializer.options().index_store;
        in_transaction(&self.backend, metrics, |tx| {
            for cell in &cells {
                tx.mutate(store, &cell.key, std::slice::from_ref(&cell.entry), NO_DELETIONS)?;
            }
            Ok(())
        })?;
        metrics.increment_custom_by(ADDED_RECORDS_COUNT, cells.len() as u64);
        Ok(())
    }
}
