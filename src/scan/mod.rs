#![forbid(unsafe_code)]
//! Partitioned full-keyspace scans and the index maintenance jobs built on them.

mod metrics;
mod remove;
mod repair;
mod scanner;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::primitives::bytes::StaticBuffer;
use crate::storage::kcv::{EntryList, KeyFilter, SliceQuery};
use crate::storage::{Backend, BackendTransaction};
use crate::types::Result;

pub use metrics::{Metric, ScanMetrics};
pub use remove::IndexRemoveJob;
pub use repair::{IndexEntryExtractor, IndexRepairJob};
pub use scanner::{split_key_range, JobState, ScanHandle, ScanReport, StandardScanner};

/// Custom counter of index entries deleted.
pub const DELETED_RECORDS_COUNT: &str = "deletes";
/// Custom counter of index entries written.
pub const ADDED_RECORDS_COUNT: &str = "adds";
/// Custom counter of per-key transactions that failed.
pub const FAILED_TX: &str = "failed-tx";
/// Job configuration key naming the index an index job works on.
pub const INDEX_NAME: &str = "index-name";

/// String-keyed settings handed to scan jobs by the host.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration(BTreeMap<String, serde_json::Value>);

impl Configuration {
    /// Empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, returning the updated configuration.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Raw value of `key`.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// String value of `key`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(serde_json::Value::as_str)
    }

    /// Unsigned value of `key`.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(serde_json::Value::as_u64)
    }

    /// Returns true when no key is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Worker pool and batching settings of a [`StandardScanner`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// Worker threads
    pub workers: usize,
    /// Keys accepted per `get_keys` call
    pub keys_per_batch: usize,
    /// Disjoint key ranges the scan is split into (at least `workers`)
    pub partitions: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(8);
        Self {
            workers,
            keys_per_batch: 1_000,
            partitions: workers * 4,
        }
    }
}

impl ScanOptions {
    /// Sets the worker count.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the batch size.
    pub fn keys_per_batch(mut self, keys: usize) -> Self {
        self.keys_per_batch = keys;
        self
    }

    /// Sets the partition count.
    pub fn partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }
}

/// Per-key work of a scan, instantiated once per worker.
///
/// The scanner calls `worker_iteration_start` before the worker's first key
/// and `worker_iteration_end` after its last, on the worker's own thread.
pub trait ScanJob: Send {
    /// Acquires worker-local resources.
    fn worker_iteration_start(
        &mut self,
        job_config: &Configuration,
        graph_config: &Configuration,
        metrics: &ScanMetrics,
    ) -> Result<()>;

    /// Releases worker-local resources.
    fn worker_iteration_end(&mut self, metrics: &ScanMetrics) -> Result<()>;

    /// Slice queries issued for every accepted key; the first one drives the
    /// key-range scan. Must not be empty.
    fn queries(&self) -> Vec<SliceQuery>;

    /// Decides which keys are in scope.
    fn key_filter(&self) -> KeyFilter;

    /// Handles one key with the entries each query returned for it.
    fn process(
        &mut self,
        key: &StaticBuffer,
        entries: &HashMap<SliceQuery, EntryList>,
        metrics: &ScanMetrics,
    ) -> Result<()>;
}

/// Immutable description of a scan; builds fresh worker-local jobs.
pub trait ScanJobFactory: Send + Sync {
    /// Job name used in reports and logs.
    fn name(&self) -> String;

    /// Checks the job's preconditions once, before any worker starts, and
    /// returns the store to scan.
    fn validate(&self) -> Result<String>;

    /// New worker-local job.
    fn create(&self) -> Result<Box<dyn ScanJob>>;
}

/// Runs `stage` against a fresh transaction and commits it; on failure the
/// transaction is rolled back and [`FAILED_TX`] is counted.
pub(crate) fn in_transaction<F>(backend: &Backend, metrics: &ScanMetrics, stage: F) -> Result<()>
where
    F: FnOnce(&mut BackendTransaction) -> Result<()>,
{
    let mut tx = backend.begin();
    let outcome = stage(&mut tx).and_then(|()| tx.commit());
    if let Err(err) = outcome {
        if tx.is_open() {
            tx.rollback()?;
        }
        metrics.increment_custom(FAILED_TX);
        return Err(err);
    }
    Ok(())
}
