//! # Filingflow
//!
//! Fault-tolerant ingestion of regulatory filings.
//!
//! A filing moves through a fixed sequence of stages (ingest, OCR, table
//! extraction, analysis, notification). Each stage reports an outcome and
//! the run rolls up to a single filing status. Failures at the task level
//! are classified: transient errors are retried with exponential backoff
//! until the budget runs out, and everything else lands in a dead-letter
//! store that operators can inspect, requeue, and close.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use filingflow::prelude::*;
//!
//! let sessions = Arc::new(SqliteSessionFactory::connect(&config.database).await?);
//! let (queue, receiver) = TaskQueue::new();
//! let tasks = Tasks::new(collaborators, sessions, Arc::new(queue.clone()), metrics, config);
//!
//! queue.enqueue(TaskMessage::process_filing("20240101000001"))?;
//! let stats = WorkerPool::new(tasks).run(receiver).await;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod collaborators;
pub mod config;
pub mod core;
pub mod dlq;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod observability;
pub mod operator;
pub mod pipeline;
pub mod retry;
pub mod stages;
pub mod store;
pub mod tasks;
pub mod testing;
pub mod worker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::collaborators::Collaborators;
    pub use crate::config::PipelineConfig;
    pub use crate::core::{Filing, FilingStatus, StageOutcome, TaskOutcome};
    pub use crate::dlq::{DeadLetterEntry, DeadLetterFilter, DeadLetterStatus, DeadLetterStore};
    pub use crate::errors::{IngestError, OperatorError, StoreError, TaskError};
    pub use crate::events::{EventSink, EventSinkHook, LoggingEventSink, NoOpEventSink};
    pub use crate::metrics::{InMemoryMetrics, MetricsRecorder};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::operator::DeadLetterOperator;
    pub use crate::pipeline::{filing_pipeline, PipelineBuilder, PipelineExecutor, PipelineRun};
    pub use crate::retry::{FailureClassifier, RetryPolicy, RetryScheduler};
    pub use crate::stages::{Stage, StageContext, StageResult};
    pub use crate::store::{MemoryStore, Session, SessionFactory, SqliteSessionFactory};
    pub use crate::tasks::{TaskMessage, TaskReport, Tasks};
    pub use crate::worker::{ShutdownToken, TaskQueue, WorkerPool};
    pub use std::sync::Arc;
}
