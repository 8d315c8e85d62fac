//! Metric sink that remembers what it was told

use std::collections::HashMap;
use std::sync::Mutex;

use crate::metrics::MetricSink;

/// Counts every increment per metric name.
#[derive(Debug, Default)]
pub struct RecordingMetricSink {
    counters: Mutex<HashMap<String, u64>>,
}

impl RecordingMetricSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `name`, zero if never incremented
    pub fn count(&self, name: &str) -> u64 {
        self.lock().get(name).copied().unwrap_or(0)
    }

    /// Copy of every counter
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MetricSink for RecordingMetricSink {
    fn increment_counter_by(&self, name: &str, count: u64) {
        *self.lock().entry(name.to_string()).or_insert(0) += count;
    }
}
