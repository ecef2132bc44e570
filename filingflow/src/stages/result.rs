//! Per-stage result records collected by the executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::StageOutcome;

/// Result of one stage execution attempt.
///
/// Ephemeral and in-memory only. Exactly one of `success()`, `skipped()`,
/// or `error().is_some()` holds, because the outcome is a single enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Stable stage identifier.
    pub name: String,
    /// Whether a failure of this stage fails the whole run.
    pub critical: bool,
    /// What happened.
    pub outcome: StageOutcome,
    /// When the stage started.
    pub started_at: DateTime<Utc>,
    /// When the stage ended.
    pub ended_at: DateTime<Utc>,
}

impl StageResult {
    /// Creates a stage result that ends now.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        critical: bool,
        outcome: StageOutcome,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            critical,
            outcome,
            started_at,
            ended_at: Utc::now(),
        }
    }

    /// Returns true if the stage succeeded.
    #[must_use]
    pub fn success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Returns true if the stage skipped.
    #[must_use]
    pub fn skipped(&self) -> bool {
        self.outcome.is_skipped()
    }

    /// Returns the failure message, if the stage failed.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            StageOutcome::Failed(message) => Some(message),
            _ => None,
        }
    }

    /// Returns the duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }
}
