//! Metrics recording for stage outcomes, errors, retries, and dead-letter depth.
//!
//! Components depend on the [`MetricsRecorder`] trait. [`FacadeMetrics`]
//! forwards to the `metrics` crate facade so that whichever exporter the
//! host installs picks the series up; [`InMemoryMetrics`] keeps them for
//! assertions.

mod events;
mod memory;

pub use events::{
    DeadLetterDepth, ErrorRaised, InternalEvent, RetryScheduled, StageCompleted, StageLatency,
};
pub use memory::InMemoryMetrics;

use std::fmt::Debug;
use std::time::Duration;

use crate::dlq::DeadLetterStatus;

/// Sink for pipeline metrics.
pub trait MetricsRecorder: Send + Sync + Debug {
    /// Records how long a run of `stage` took.
    fn observe_stage_latency(&self, stage: &str, elapsed: Duration);

    /// Counts one result label (`completed`, `partial`, `failed`, `skipped`, `error`).
    fn increment_stage_result(&self, stage: &str, result: &str);

    /// Counts one error of `kind` raised in `stage`.
    fn increment_error(&self, stage: &str, kind: &str);

    /// Counts one scheduled retry of `task`.
    fn increment_retry(&self, task: &str);

    /// Publishes the number of dead letters in `status`.
    fn set_dead_letter_depth(&self, status: DeadLetterStatus, count: u64);
}

/// Discards every observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl MetricsRecorder for NoOpMetrics {
    fn observe_stage_latency(&self, _stage: &str, _elapsed: Duration) {}

    fn increment_stage_result(&self, _stage: &str, _result: &str) {}

    fn increment_error(&self, _stage: &str, _kind: &str) {}

    fn increment_retry(&self, _task: &str) {}

    fn set_dead_letter_depth(&self, _status: DeadLetterStatus, _count: u64) {}
}

/// Emits through the `metrics` crate macros.
#[derive(Debug, Clone, Copy, Default)]
pub struct FacadeMetrics;

impl MetricsRecorder for FacadeMetrics {
    fn observe_stage_latency(&self, stage: &str, elapsed: Duration) {
        StageLatency {
            stage: stage.to_string(),
            elapsed,
        }
        .emit();
    }

    fn increment_stage_result(&self, stage: &str, result: &str) {
        StageCompleted {
            stage: stage.to_string(),
            result: result.to_string(),
        }
        .emit();
    }

    fn increment_error(&self, stage: &str, kind: &str) {
        ErrorRaised {
            stage: stage.to_string(),
            kind: kind.to_string(),
        }
        .emit();
    }

    fn increment_retry(&self, task: &str) {
        RetryScheduled {
            task: task.to_string(),
        }
        .emit();
    }

    fn set_dead_letter_depth(&self, status: DeadLetterStatus, count: u64) {
        DeadLetterDepth { status, count }.emit();
    }
}
