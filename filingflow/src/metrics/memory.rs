//! Metrics recorder that keeps observations in memory.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

use super::MetricsRecorder;
use crate::dlq::DeadLetterStatus;

#[derive(Debug, Default)]
struct Recorded {
    latencies: Vec<(String, Duration)>,
    results: HashMap<(String, String), u64>,
    errors: HashMap<(String, String), u64>,
    retries: HashMap<String, u64>,
    depth: HashMap<DeadLetterStatus, u64>,
}

/// Captures every observation for later inspection.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    inner: Mutex<Recorded>,
}

impl InMemoryMetrics {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of latency observations for `stage`.
    #[must_use]
    pub fn latency_count(&self, stage: &str) -> usize {
        self.inner
            .lock()
            .latencies
            .iter()
            .filter(|(s, _)| s == stage)
            .count()
    }

    /// Count for one `(stage, result)` pair.
    #[must_use]
    pub fn result_count(&self, stage: &str, result: &str) -> u64 {
        self.inner
            .lock()
            .results
            .get(&(stage.to_string(), result.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Total result increments for `stage`, across labels.
    #[must_use]
    pub fn total_results(&self, stage: &str) -> u64 {
        self.inner
            .lock()
            .results
            .iter()
            .filter(|((s, _), _)| s == stage)
            .map(|(_, n)| n)
            .sum()
    }

    /// Count for one `(stage, kind)` error pair.
    #[must_use]
    pub fn error_count(&self, stage: &str, kind: &str) -> u64 {
        self.inner
            .lock()
            .errors
            .get(&(stage.to_string(), kind.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Retries scheduled for `task`.
    #[must_use]
    pub fn retry_count(&self, task: &str) -> u64 {
        self.inner.lock().retries.get(task).copied().unwrap_or(0)
    }

    /// Last published depth for `status`, if any.
    #[must_use]
    pub fn dead_letter_depth(&self, status: DeadLetterStatus) -> Option<u64> {
        self.inner.lock().depth.get(&status).copied()
    }
}

impl MetricsRecorder for InMemoryMetrics {
    fn observe_stage_latency(&self, stage: &str, elapsed: Duration) {
        self.inner
            .lock()
            .latencies
            .push((stage.to_string(), elapsed));
    }

    fn increment_stage_result(&self, stage: &str, result: &str) {
        *self
            .inner
            .lock()
            .results
            .entry((stage.to_string(), result.to_string()))
            .or_insert(0) += 1;
    }

    fn increment_error(&self, stage: &str, kind: &str) {
        *self
            .inner
            .lock()
            .errors
            .entry((stage.to_string(), kind.to_string()))
            .or_insert(0) += 1;
    }

    fn increment_retry(&self, task: &str) {
        *self
            .inner
            .lock()
            .retries
            .entry(task.to_string())
            .or_insert(0) += 1;
    }

    fn set_dead_letter_depth(&self, status: DeadLetterStatus, count: u64) {
        self.inner.lock().depth.insert(status, count);
    }
}
