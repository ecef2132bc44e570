//! Internal events emitted as `metrics` series.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

use crate::dlq::DeadLetterStatus;

/// Something measurable that can be emitted as a metric.
pub trait InternalEvent {
    /// Emits this event.
    fn emit(self);
}

/// One pipeline or task run finished.
pub struct StageLatency {
    /// Pipeline-stage name the run is keyed by.
    pub stage: String,
    /// Wall time of the run.
    pub elapsed: Duration,
}

impl InternalEvent for StageLatency {
    fn emit(self) {
        trace!(stage = %self.stage, elapsed_ms = self.elapsed.as_millis() as u64, "Stage latency");
        histogram!("filingflow_stage_latency_seconds", "stage" => self.stage)
            .record(self.elapsed.as_secs_f64());
    }
}

/// One run ended with a result label.
pub struct StageCompleted {
    /// Pipeline-stage name.
    pub stage: String,
    /// Result label.
    pub result: String,
}

impl InternalEvent for StageCompleted {
    fn emit(self) {
        trace!(stage = %self.stage, result = %self.result, "Stage result");
        counter!(
            "filingflow_stage_results_total",
            "stage" => self.stage,
            "result" => self.result
        )
        .increment(1);
    }
}

/// An error was raised.
pub struct ErrorRaised {
    /// Where it was raised.
    pub stage: String,
    /// Error kind (`transient`, `fatal`, `table_extraction`, ...).
    pub kind: String,
}

impl InternalEvent for ErrorRaised {
    fn emit(self) {
        trace!(stage = %self.stage, kind = %self.kind, "Error raised");
        counter!(
            "filingflow_errors_total",
            "stage" => self.stage,
            "kind" => self.kind
        )
        .increment(1);
    }
}

/// A retry was scheduled.
pub struct RetryScheduled {
    /// Task being retried.
    pub task: String,
}

impl InternalEvent for RetryScheduled {
    fn emit(self) {
        trace!(task = %self.task, "Retry scheduled");
        counter!("filingflow_task_retries_total", "task" => self.task).increment(1);
    }
}

/// Current number of dead letters in one status.
pub struct DeadLetterDepth {
    /// Status bucket.
    pub status: DeadLetterStatus,
    /// Entries in that status.
    pub count: u64,
}

impl InternalEvent for DeadLetterDepth {
    fn emit(self) {
        trace!(status = %self.status, count = self.count, "Dead letter depth");
        gauge!("filingflow_dead_letters", "status" => self.status.as_str())
            .set(self.count as f64);
    }
}
