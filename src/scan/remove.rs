use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::index::{get_index_id_from_key, IndexDescriptor, IndexSerializer, IndexType, SchemaStatus};
use crate::primitives::bytes::StaticBuffer;
use crate::storage::kcv::{EntryList, KeyFilter, SliceQuery};
use crate::storage::{Backend, NO_ADDITIONS};
use crate::types::{ElementId, KcvError, Result};

use super::{
    in_transaction, Configuration, ScanJob, ScanJobFactory, ScanMetrics, DELETED_RECORDS_COUNT,
    INDEX_NAME,
};

/// Deletes every stored entry of a disabled index.
///
/// Composite indexes are removed by scanning the index store for rows whose
/// key starts with the index id; relation-type indexes by scanning vertex
/// rows for the index's column range. Running the job twice is harmless:
/// the second run finds nothing to delete.
pub struct IndexRemoveJob {
    backend: Arc<Backend>,
    serializer: Arc<IndexSerializer>,
    index: String,
}

impl IndexRemoveJob {
    /// Job removing index `index`.
    pub fn new(
        backend: Arc<Backend>,
        serializer: Arc<IndexSerializer>,
        index: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            serializer,
            index: index.into(),
        }
    }

    /// Job removing the index named by the [`INDEX_NAME`] entry of `config`.
    pub fn from_config(
        backend: Arc<Backend>,
        serializer: Arc<IndexSerializer>,
        config: &Configuration,
    ) -> Result<Self> {
        let index = config
            .get_str(INDEX_NAME)
            .ok_or_else(|| KcvError::invalid(format!("job configuration lacks `{INDEX_NAME}`")))?;
        Ok(Self::new(backend, serializer, index))
    }

    /// Name of the index being removed.
    pub fn index(&self) -> &str {
        &self.index
    }

    fn resolve(&self) -> Result<Target> {
        Target::resolve(&self.serializer, &self.index)
    }
}

impl ScanJobFactory for IndexRemoveJob {
    fn name(&self) -> String {
        format!("index-remove:{}", self.index)
    }

    fn validate(&self) -> Result<String> {
        Ok(self.resolve()?.store)
    }

    fn create(&self) -> Result<Box<dyn ScanJob>> {
        Ok(Box::new(RemoveWorker {
            backend: Arc::clone(&self.backend),
            serializer: Arc::clone(&self.serializer),
            index: self.index.clone(),
            target: None,
        }))
    }
}

struct Target {
    descriptor: IndexDescriptor,
    store: String,
    query: SliceQuery,
}

impl Target {
    fn resolve(serializer: &IndexSerializer, name: &str) -> Result<Self> {
        let descriptor = serializer.schema().index(name)?;
        if descriptor.is_mixed() {
            return Err(KcvError::UnsupportedFeature(
                "removing mixed indexes; drop them in the external index backend",
            ));
        }
        if descriptor.status != SchemaStatus::Disabled {
            return Err(KcvError::Precondition(format!(
                "index `{name}` must be disabled before removal, found {}",
                descriptor.status
            )));
        }
        let options = serializer.options();
        let (store, query) = match descriptor.relation_slice() {
            Some(slice) => (options.edge_store.clone(), slice?),
            None => (options.index_store.clone(), SliceQuery::full_row()),
        };
        Ok(Self {
            descriptor,
            store,
            query,
        })
    }
}

struct RemoveWorker {
    backend: Arc<Backend>,
    serializer: Arc<IndexSerializer>,
    index: String,
    target: Option<Target>,
}

impl RemoveWorker {
    fn target(&self) -> Result<&Target> {
        self.target
            .as_ref()
            .ok_or(KcvError::Closed("index removal worker"))
    }
}

impl ScanJob for RemoveWorker {
    fn worker_iteration_start(
        &mut self,
        _job_config: &Configuration,
        _graph_config: &Configuration,
        _metrics: &ScanMetrics,
    ) -> Result<()> {
        let target = Target::resolve(&self.serializer, &self.index)?;
        debug!(index = %self.index, store = %target.store, "scan.index_remove.worker_start");
        self.target = Some(target);
        Ok(())
    }

    fn worker_iteration_end(&mut self, metrics: &ScanMetrics) -> Result<()> {
        if self.target.take().is_some() {
            info!(
                index = %self.index,
                deletes = metrics.get_custom(DELETED_RECORDS_COUNT),
                "scan.index_remove.worker_end"
            );
        }
        Ok(())
    }

    fn queries(&self) -> Vec<SliceQuery> {
        self.target
            .as_ref()
            .map(|t| vec![t.query.clone()])
            .unwrap_or_default()
    }

    fn key_filter(&self) -> KeyFilter {
        let Some(target) = self.target.as_ref() else {
            return Arc::new(|_: &StaticBuffer| false);
        };
        match target.descriptor.index_type {
            IndexType::RelationType { .. } => {
                let schema = Arc::clone(self.serializer.schema());
                Arc::new(move |key: &StaticBuffer| match key.u64_at(0) {
                    Ok(vertex) => !schema.is_reserved_vertex(ElementId(vertex)),
                    Err(err) => {
                        warn!(key = %key, error = %err, "scan.index_remove.undecodable_key");
                        false
                    }
                })
            }
            _ => {
                let wanted = target.descriptor.id;
                Arc::new(move |key: &StaticBuffer| match get_index_id_from_key(key) {
                    Ok(id) => id == wanted,
                    Err(err) => {
                        warn!(key = %key, error = %err, "scan.index_remove.undecodable_key");
                        false
                    }
                })
            }
        }
    }

    fn process(
        &mut self,
        key: &StaticBuffer,
        entries: &HashMap<SliceQuery, EntryList>,
        metrics: &ScanMetrics,
    ) -> Result<()> {
        let target = self.target()?;
        let deletions: Vec<StaticBuffer> = entries
            .values()
            .flatten()
            .map(|entry| entry.column.clone())
            .collect();
        if deletions.is_empty() {
            return Ok(());
        }
        in_transaction(&self.backend, metrics, |tx| {
            tx.mutate(&target.store, key, NO_ADDITIONS, &deletions)
        })?;
        metrics.increment_custom_by(DELETED_RECORDS_COUNT, deletions.len() as u64);
        Ok(())
    }
}
