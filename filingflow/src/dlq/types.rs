//! Dead-letter records and filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::payload::Payload;
use crate::core::Correlation;

/// Lifecycle of a dead letter: pending, then requeued, then completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterStatus {
    /// Recorded, awaiting operator action.
    Pending,
    /// Redelivery was attempted.
    Requeued,
    /// The retried job succeeded.
    Completed,
}

impl DeadLetterStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 3] = [Self::Pending, Self::Requeued, Self::Completed];

    /// Returns the persisted representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Requeued => "requeued",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DeadLetterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "requeued" => Ok(Self::Requeued),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown dead-letter status '{other}'")),
        }
    }
}

/// A durable record of one terminally-failed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Opaque identifier.
    pub id: Uuid,
    /// Logical job type that failed.
    pub task_name: String,
    /// Filing receipt number.
    pub receipt_no: Option<String>,
    /// Issuer code.
    pub corp_code: Option<String>,
    /// Ticker.
    pub ticker: Option<String>,
    /// Input needed to re-invoke the task.
    pub payload: Payload,
    /// Truncated failure message.
    pub error: String,
    /// Retries consumed before dead-lettering.
    pub retries: u32,
    /// Lifecycle status.
    pub status: DeadLetterStatus,
    /// When a requeued entry is due to run again.
    pub next_run_at: Option<DateTime<Utc>>,
    /// When the failure was recorded.
    pub last_error_at: DateTime<Utc>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Correlation fields of this entry.
    #[must_use]
    pub fn correlation(&self) -> Correlation {
        Correlation {
            receipt_no: self.receipt_no.clone(),
            corp_code: self.corp_code.clone(),
            ticker: self.ticker.clone(),
        }
    }

    /// Moves the entry to `status`, touching `updated_at`.
    pub(crate) fn transition(&mut self, status: DeadLetterStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

/// Input for recording a dead letter.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDeadLetter {
    /// Logical job type.
    pub task_name: String,
    /// Retry payload.
    pub payload: Payload,
    /// Failure message, truncated on insert.
    pub error: String,
    /// Retries consumed. Negative counts are clamped to zero.
    pub retries: i64,
    /// Correlation fields.
    pub correlation: Correlation,
}

impl NewDeadLetter {
    /// Creates a dead letter with no retries and no correlation.
    #[must_use]
    pub fn new(task_name: impl Into<String>, payload: Payload, error: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            payload,
            error: error.into(),
            retries: 0,
            correlation: Correlation::default(),
        }
    }

    /// Sets the consumed retry count.
    #[must_use]
    pub fn with_retries(mut self, retries: i64) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the correlation fields.
    #[must_use]
    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }
}

/// Listing filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterFilter {
    /// Only entries in this status.
    pub status: Option<DeadLetterStatus>,
    /// Only entries for this task.
    pub task_name: Option<String>,
    /// Only entries scheduled to run at or before this instant.
    pub due_by: Option<DateTime<Utc>>,
    /// Maximum rows returned.
    pub limit: usize,
}

impl DeadLetterFilter {
    /// Creates a filter returning up to `limit` rows.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Restricts to one status.
    #[must_use]
    pub fn with_status(mut self, status: DeadLetterStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts to one task name.
    #[must_use]
    pub fn with_task_name(mut self, task_name: impl Into<String>) -> Self {
        self.task_name = Some(task_name.into());
        self
    }

    /// Restricts to entries whose `next_run_at` is set and not after `at`.
    #[must_use]
    pub fn with_due_by(mut self, at: DateTime<Utc>) -> Self {
        self.due_by = Some(at);
        self
    }

    /// True if `entry` passes this filter (the limit is not considered).
    #[must_use]
    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.status.map_or(true, |s| entry.status == s)
            && self
                .task_name
                .as_deref()
                .map_or(true, |t| entry.task_name == t)
            && self
                .due_by
                .map_or(true, |at| entry.next_run_at.is_some_and(|next| next <= at))
    }
}
