use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;

/// Built-in counters every scan maintains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Keys whose `process` call returned normally.
    Success,
    /// Keys whose `process` call failed, plus failed worker lifecycles.
    Failure,
}

/// Counters shared by every worker of one scan.
///
/// All updates are relaxed atomic increments; readers see eventually
/// consistent totals while the scan runs and exact totals after it ends.
#[derive(Default)]
pub struct ScanMetrics {
    success: AtomicU64,
    failure: AtomicU64,
    custom: RwLock<FxHashMap<String, Arc<AtomicU64>>>,
}

impl ScanMetrics {
    /// Fresh, zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    fn builtin(&self, metric: Metric) -> &AtomicU64 {
        match metric {
            Metric::Success => &self.success,
            Metric::Failure => &self.failure,
        }
    }

    /// Adds one to a built-in counter.
    pub fn increment(&self, metric: Metric) {
        self.builtin(metric).fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of a built-in counter.
    pub fn get(&self, metric: Metric) -> u64 {
        self.builtin(metric).load(Ordering::Relaxed)
    }

    fn counter(&self, name: &str) -> Arc<AtomicU64> {
        if let Some(counter) = self.custom.read().get(name) {
            return Arc::clone(counter);
        }
        Arc::clone(self.custom.write().entry(name.to_string()).or_default())
    }

    /// Adds one to custom counter `name`, creating it on first use.
    pub fn increment_custom(&self, name: &str) {
        self.increment_custom_by(name, 1);
    }

    /// Adds `delta` to custom counter `name`, creating it on first use.
    pub fn increment_custom_by(&self, name: &str, delta: u64) {
        self.counter(name).fetch_add(delta, Ordering::Relaxed);
    }

    /// Current value of custom counter `name`; 0 when never touched.
    pub fn get_custom(&self, name: &str) -> u64 {
        self.custom
            .read()
            .get(name)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Every custom counter, by name.
    pub fn custom_snapshot(&self) -> BTreeMap<String, u64> {
        self.custom
            .read()
            .iter()
            .map(|(name, c)| (name.clone(), c.load(Ordering::Relaxed)))
            .collect()
    }
}
