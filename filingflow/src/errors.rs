//! Error types for the filingflow pipeline.
//!
//! Two layers of failure exist. Stage-level failures never escape the
//! executor; they are captured as [`StageOutcome`](crate::core::StageOutcome)
//! values. Task-level failures are expressed as [`IngestError`] and routed
//! through the retry classifier, which turns them into a [`TaskError`].

use std::any::Any;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Task-level failure taxonomy.
///
/// Every call to an external collaborator is translated into one of these
/// two kinds. They carry only a message; they are control-flow signals, not
/// persisted entities.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum IngestError {
    /// Assumed-recoverable failure, eligible for backoff retry.
    #[error("transient ingest error: {0}")]
    Transient(String),

    /// Unrecoverable failure, always dead-lettered.
    #[error("fatal ingest error: {0}")]
    Fatal(String),
}

impl IngestError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Returns the bare message without the kind prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Fatal(msg) => msg,
        }
    }

    /// Returns true for transient errors.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns the kind label used in logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Fatal(_) => "fatal",
        }
    }

    /// Converts into a fatal error wrapping the original message.
    #[must_use]
    pub fn escalate(self) -> Self {
        match self {
            Self::Transient(msg) => Self::Fatal(msg),
            fatal @ Self::Fatal(_) => fatal,
        }
    }
}

/// Renders a caught panic payload as a message.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Errors returned by external collaborators (extraction, analysis, feeds).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// No source documents exist for the filing. This is a skip signal, not a defect.
    #[error("no source documents: {0}")]
    NoSources(String),

    /// The collaborator was handed empty input.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// A remote dependency could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// The collaborator explicitly signalled that retrying cannot help.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CollaboratorError {
    /// Creates a connection error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Creates an unrecoverable error.
    #[must_use]
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::Unrecoverable(message.into())
    }
}

impl From<CollaboratorError> for IngestError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Unrecoverable(msg) => Self::Fatal(msg),
            other => Self::Transient(other.to_string()),
        }
    }
}

/// Failure raised by the table extraction collaborator.
///
/// Table failures are recorded as dead letters and never retried.
#[derive(Debug, Clone, Error)]
#[error("table extraction failed: {message}")]
pub struct TableExtractionError {
    /// Failure description.
    pub message: String,
}

impl TableExtractionError {
    /// Creates a new table extraction error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database driver error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON encoding or decoding of a stored column failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The unit of work was already committed or rolled back.
    #[error("unit of work is closed")]
    Closed,

    /// A stored row could not be decoded.
    #[error("corrupt row in {table}: {reason}")]
    Corrupt {
        /// Table the row came from.
        table: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Creates a corrupt-row error.
    #[must_use]
    pub fn corrupt(table: &'static str, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        Self::Transient(err.to_string())
    }
}

/// Failure to hand a retry to the task queue.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// The queue is no longer accepting messages.
    #[error("task queue is closed")]
    Closed,

    /// The backend rejected the message.
    #[error("scheduling rejected: {0}")]
    Rejected(String),
}

/// Failures of the dead-letter operator surface.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No entry with this id.
    #[error("dead letter {0} not found")]
    NotFound(Uuid),

    /// The entry's task cannot be re-dispatched.
    #[error("cannot re-dispatch unknown task '{0}'")]
    UnknownTask(String),

    /// The retry scheduler refused the message.
    #[error("re-dispatch failed: {0}")]
    Schedule(#[from] SchedulerError),

    /// Dispatching was asked of an operator without a scheduler.
    #[error("no task queue attached")]
    NoScheduler,
}

/// Error returned by a task entry point.
///
/// Both `RetryScheduled` and `Fatal` mean the invocation failed; the task
/// runner is expected to record them as failures.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A transient failure was scheduled for another attempt.
    #[error("retry {attempt} scheduled in {}s: {cause}", delay.as_secs())]
    RetryScheduled {
        /// The attempt number the retry will run as.
        attempt: u32,
        /// Delay before the retry is delivered.
        delay: Duration,
        /// The failure that triggered the retry.
        cause: IngestError,
    },

    /// The failure was dead-lettered (or the dead-letter write itself failed).
    #[error("{error}")]
    Fatal {
        /// The fatal error.
        error: IngestError,
        /// Identifier of the persisted dead letter, if persistence succeeded.
        dead_letter_id: Option<Uuid>,
    },

    /// No entry point is registered under the task name.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// The payload could not be turned into the task's arguments.
    #[error("invalid payload for {task}: {reason}")]
    InvalidPayload {
        /// Task name.
        task: String,
        /// Decoding failure.
        reason: String,
    },
}

impl TaskError {
    /// Returns true if a retry was scheduled.
    #[must_use]
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::RetryScheduled { .. })
    }

    /// Returns true if the failure was routed to the fatal path.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

/// Error raised when a pipeline definition is invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    Io {
        /// Path that was read.
        path: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The configuration could not be parsed.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override had an unusable value.
    #[error("invalid value for {key}: {value}")]
    InvalidEnv {
        /// Environment variable name.
        key: String,
        /// The rejected value.
        value: String,
    },
}
