use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::primitives::bytes::StaticBuffer;
use crate::storage::kcv::{
    KeyColumnValueStore, KeyFilter, KeyRange, KeySelector, SliceQuery, StoreManager,
};
use crate::types::{KcvError, Result};

use super::{Configuration, Metric, ScanJob, ScanJobFactory, ScanMetrics, ScanOptions};

/// Lifecycle of one scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, not yet validated.
    Created,
    /// Preconditions hold.
    Validated,
    /// Workers are scanning.
    Running,
    /// Every key was processed without failure.
    Completed,
    /// At least one failure, or the scan was cancelled.
    Failed,
}

/// Outcome of a finished scan.
#[derive(Clone, Debug, Serialize)]
pub struct ScanReport {
    /// Job name.
    pub job: String,
    /// Final state, `Completed` or `Failed`.
    pub state: JobState,
    /// Keys processed successfully.
    pub successes: u64,
    /// Failed keys and failed worker lifecycles.
    pub failures: u64,
    /// Keys handed to `process`.
    pub keys_scanned: u64,
    /// Job-specific counters.
    pub custom: BTreeMap<String, u64>,
    /// Whether the scan was cancelled before finishing.
    pub cancelled: bool,
    /// Wall-clock duration.
    pub elapsed_ms: u64,
}

impl ScanReport {
    /// Returns true when the scan completed.
    pub fn is_success(&self) -> bool {
        self.state == JobState::Completed
    }

    /// Value of custom counter `name`; 0 when never touched.
    pub fn custom(&self, name: &str) -> u64 {
        self.custom.get(name).copied().unwrap_or(0)
    }

    /// Turns a failed report into [`KcvError::ScanFailed`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(KcvError::ScanFailed {
                job: self.job,
                failures: self.failures,
                successes: self.successes,
            })
        }
    }
}

struct ScanShared {
    state: Mutex<JobState>,
    metrics: ScanMetrics,
    cancelled: AtomicBool,
    keys_scanned: AtomicU64,
}

impl ScanShared {
    fn transition(&self, job: &str, next: JobState) {
        let mut state = self.state.lock();
        debug!(job, from = ?*state, to = ?next, "scan.job.state");
        *state = next;
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Running scan; cancel it or wait for its report.
pub struct ScanHandle {
    job: String,
    shared: Arc<ScanShared>,
    coordinator: thread::JoinHandle<ScanReport>,
}

impl ScanHandle {
    /// Asks every worker to stop after its current key.
    pub fn cancel(&self) {
        if !self.shared.cancelled.swap(true, Ordering::AcqRel) {
            info!(job = %self.job, "scan.job.cancel");
        }
    }

    /// Returns true once [`ScanHandle::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        *self.shared.state.lock()
    }

    /// Live metrics of the scan.
    pub fn metrics(&self) -> &ScanMetrics {
        &self.shared.metrics
    }

    /// Keys processed so far, as reported by workers after each batch.
    pub fn keys_scanned(&self) -> u64 {
        self.shared.keys_scanned.load(Ordering::Relaxed)
    }

    /// Blocks until every worker has finished.
    pub fn join(self) -> Result<ScanReport> {
        self.coordinator.join().map_err(|_| KcvError::ScanFailed {
            job: self.job.clone(),
            failures: self.shared.metrics.get(Metric::Failure),
            successes: self.shared.metrics.get(Metric::Success),
        })
    }
}

enum WorkerEvent {
    Progress { worker: usize, keys: u64 },
    Finished { worker: usize },
}

/// Runs a [`ScanJobFactory`] over a key range of one store with a pool of
/// worker threads.
///
/// The range is cut into disjoint partitions up front; workers pull
/// partitions from a shared queue, scan them batch by batch, and report
/// progress to a coordinator thread over a channel.
pub struct StandardScanner {
    manager: Arc<dyn StoreManager>,
    options: ScanOptions,
}

impl StandardScanner {
    /// Scanner over the stores of `manager`.
    pub fn new(manager: Arc<dyn StoreManager>, options: ScanOptions) -> Self {
        Self { manager, options }
    }

    /// Options in effect.
    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Validates the job and starts scanning `range` in the background.
    /// Validation failures are returned before any key is read.
    pub fn start(
        &self,
        factory: Arc<dyn ScanJobFactory>,
        range: KeyRange,
        job_config: Configuration,
        graph_config: Configuration,
    ) -> Result<ScanHandle> {
        if self.options.workers == 0 || self.options.keys_per_batch == 0 {
            return Err(KcvError::invalid(format!(
                "scan needs at least one worker and one key per batch, got {} and {}",
                self.options.workers, self.options.keys_per_batch
            )));
        }
        let job = factory.name();
        let shared = Arc::new(ScanShared {
            state: Mutex::new(JobState::Created),
            metrics: ScanMetrics::new(),
            cancelled: AtomicBool::new(false),
            keys_scanned: AtomicU64::new(0),
        });
        let store_name = factory.validate().inspect_err(|err| {
            warn!(job = %job, error = %err, "scan.job.rejected");
        })?;
        shared.transition(&job, JobState::Validated);

        let store = self.manager.open_store(&store_name)?;
        let partitions = split_key_range(&range, self.options.partitions.max(self.options.workers))?;
        info!(
            job = %job,
            store = %store_name,
            workers = self.options.workers,
            partitions = partitions.len(),
            "scan.job.start"
        );
        let queue = Arc::new(Mutex::new(VecDeque::from(partitions)));
        let job_config = Arc::new(job_config);
        let graph_config = Arc::new(graph_config);
        let (events, receiver) = mpsc::channel();
        shared.transition(&job, JobState::Running);

        let started = Instant::now();
        let mut workers = Vec::with_capacity(self.options.workers);
        for worker in 0..self.options.workers {
            let ctx = Worker {
                id: worker,
                job: job.clone(),
                factory: Arc::clone(&factory),
                store: Arc::clone(&store),
                queue: Arc::clone(&queue),
                shared: Arc::clone(&shared),
                events: events.clone(),
                job_config: Arc::clone(&job_config),
                graph_config: Arc::clone(&graph_config),
                keys_per_batch: self.options.keys_per_batch,
            };
            let spawned = thread::Builder::new()
                .name(format!("scan-{job}-{worker}"))
                .spawn(move || ctx.run());
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    shared.cancelled.store(true, Ordering::Release);
                    return Err(err.into());
                }
            }
        }
        drop(events);

        let coordinator = {
            let job = job.clone();
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("scan-{job}-coordinator"))
                .spawn(move || coordinate(job, receiver, workers, shared, started))?
        };
        Ok(ScanHandle {
            job,
            shared,
            coordinator,
        })
    }

    /// Runs the job to the end; a failed scan becomes [`KcvError::ScanFailed`].
    pub fn run(
        &self,
        factory: Arc<dyn ScanJobFactory>,
        range: KeyRange,
        job_config: Configuration,
        graph_config: Configuration,
    ) -> Result<ScanReport> {
        self.start(factory, range, job_config, graph_config)?
            .join()?
            .into_result()
    }
}

fn coordinate(
    job: String,
    receiver: Receiver<WorkerEvent>,
    workers: Vec<thread::JoinHandle<()>>,
    shared: Arc<ScanShared>,
    started: Instant,
) -> ScanReport {
    for event in receiver {
        match event {
            WorkerEvent::Progress { worker, keys } => {
                let total = shared.keys_scanned.fetch_add(keys, Ordering::Relaxed) + keys;
                debug!(job = %job, worker, keys, total, "scan.progress");
            }
            WorkerEvent::Finished { worker } => {
                debug!(job = %job, worker, "scan.worker.finished");
            }
        }
    }
    for handle in workers {
        if handle.join().is_err() {
            shared.metrics.increment(Metric::Failure);
            error!(job = %job, "scan.worker.panicked");
        }
    }

    let cancelled = shared.is_cancelled();
    let successes = shared.metrics.get(Metric::Success);
    let failures = shared.metrics.get(Metric::Failure);
    let state = if failures == 0 && !cancelled {
        JobState::Completed
    } else {
        JobState::Failed
    };
    shared.transition(&job, state);
    let report = ScanReport {
        job,
        state,
        successes,
        failures,
        keys_scanned: shared.keys_scanned.load(Ordering::Relaxed),
        custom: shared.metrics.custom_snapshot(),
        cancelled,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        job = %report.job,
        state = ?report.state,
        successes,
        failures,
        cancelled,
        elapsed_ms = report.elapsed_ms,
        "scan.job.completed"
    );
    report
}

struct Worker {
    id: usize,
    job: String,
    factory: Arc<dyn ScanJobFactory>,
    store: Arc<dyn KeyColumnValueStore>,
    queue: Arc<Mutex<VecDeque<KeyRange>>>,
    shared: Arc<ScanShared>,
    events: Sender<WorkerEvent>,
    job_config: Arc<Configuration>,
    graph_config: Arc<Configuration>,
    keys_per_batch: usize,
}

impl Worker {
    fn run(self) {
        let metrics = &self.shared.metrics;
        let mut job = match self.factory.create() {
            Ok(job) => job,
            Err(err) => {
                metrics.increment(Metric::Failure);
                error!(job = %self.job, worker = self.id, error = %err, "scan.worker.failed");
                return;
            }
        };
        if let Err(err) =
            job.worker_iteration_start(&self.job_config, &self.graph_config, metrics)
        {
            metrics.increment(Metric::Failure);
            error!(job = %self.job, worker = self.id, error = %err, "scan.worker.failed");
            return;
        }
        if let Err(err) = self.scan(job.as_mut()) {
            metrics.increment(Metric::Failure);
            error!(job = %self.job, worker = self.id, error = %err, "scan.worker.failed");
        }
        if let Err(err) = job.worker_iteration_end(metrics) {
            metrics.increment(Metric::Failure);
            error!(job = %self.job, worker = self.id, error = %err, "scan.worker.end_failed");
        }
        let _ = self.events.send(WorkerEvent::Finished { worker: self.id });
    }

    fn next_partition(&self) -> Option<KeyRange> {
        if self.shared.is_cancelled() {
            return None;
        }
        self.queue.lock().pop_front()
    }

    fn scan(&self, job: &mut dyn ScanJob) -> Result<()> {
        let queries = job.queries();
        let Some((driver, others)) = queries.split_first() else {
            return Err(KcvError::invalid("scan job issued no slice queries"));
        };
        let filter = job.key_filter();
        while let Some(partition) = self.next_partition() {
            self.scan_partition(job, &partition, driver, others, &filter)?;
        }
        Ok(())
    }

    fn scan_partition(
        &self,
        job: &mut dyn ScanJob,
        partition: &KeyRange,
        driver: &SliceQuery,
        others: &[SliceQuery],
        filter: &KeyFilter,
    ) -> Result<()> {
        let metrics = &self.shared.metrics;
        let mut cursor = partition.clone();
        loop {
            let selector = KeySelector::new(Arc::clone(filter), self.keys_per_batch)?;
            let mut seen = 0usize;
            let mut last = None;
            for row in self.store.get_keys(&cursor, driver, selector)? {
                if self.shared.is_cancelled() {
                    self.report(seen);
                    return Ok(());
                }
                let row = row?;
                let mut entries = HashMap::with_capacity(others.len() + 1);
                for query in others {
                    entries.insert(query.clone(), self.store.get_slice(&row.key, query)?);
                }
                entries.insert(driver.clone(), row.entries);
                match job.process(&row.key, &entries, metrics) {
                    Ok(()) => metrics.increment(Metric::Success),
                    Err(err) => {
                        metrics.increment(Metric::Failure);
                        warn!(
                            job = %self.job,
                            worker = self.id,
                            key = %row.key,
                            error = %err,
                            "scan.key.failed"
                        );
                    }
                }
                seen += 1;
                last = Some(row.key);
            }
            self.report(seen);
            match last {
                Some(last) if seen == self.keys_per_batch => {
                    cursor = resume_after(&last, partition)?;
                }
                _ => return Ok(()),
            }
        }
    }

    fn report(&self, keys: usize) {
        if keys > 0 {
            let _ = self.events.send(WorkerEvent::Progress {
                worker: self.id,
                keys: keys as u64,
            });
        }
    }
}

/// Smallest range of `partition` holding only keys after `last`.
fn resume_after(last: &StaticBuffer, partition: &KeyRange) -> Result<KeyRange> {
    let mut next = Vec::with_capacity(last.len() + 1);
    next.extend_from_slice(last.as_slice());
    next.push(0x00);
    let start = StaticBuffer::from(next);
    match partition.end() {
        Some(end) => KeyRange::new(start, end.clone()),
        None => Ok(KeyRange::from(start)),
    }
}

fn prefix_u64(key: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    let n = key.len().min(8);
    raw[..n].copy_from_slice(&key[..n]);
    u64::from_be_bytes(raw)
}

/// Cuts `range` into at most `parts` disjoint, contiguous sub-ranges whose
/// union is `range`, balancing on the first eight key bytes.
pub fn split_key_range(range: &KeyRange, parts: usize) -> Result<Vec<KeyRange>> {
    if parts <= 1 || range.is_empty() {
        return Ok(vec![range.clone()]);
    }
    let lo = u128::from(prefix_u64(range.start()));
    let hi = match range.end() {
        Some(end) => u128::from(prefix_u64(end)),
        None => 1u128 << 64,
    };
    let step = hi.saturating_sub(lo) / parts as u128;
    if step == 0 {
        return Ok(vec![range.clone()]);
    }

    let mut cuts: Vec<StaticBuffer> = Vec::with_capacity(parts - 1);
    for i in 1..parts as u128 {
        let Ok(bound) = u64::try_from(lo + step * i) else {
            break;
        };
        let cut = StaticBuffer::from_u64(bound);
        let inside = cut > *range.start() && range.end().map_or(true, |end| cut < *end);
        if inside && cuts.last().map_or(true, |prev| cut > *prev) {
            cuts.push(cut);
        }
    }

    let mut out = Vec::with_capacity(cuts.len() + 1);
    let mut start = range.start().clone();
    for cut in cuts {
        out.push(KeyRange::new(start, cut.clone())?);
        start = cut;
    }
    out.push(match range.end() {
        Some(end) => KeyRange::new(start, end.clone())?,
        None => KeyRange::from(start),
    });
    Ok(out)
}
