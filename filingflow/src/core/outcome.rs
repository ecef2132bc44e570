//! Stage outcome type returned by every stage.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The outcome of one stage execution.
///
/// A skip is not a failure: it means the stage had nothing valid to do for
/// this document. It is never logged as an error and never counts against
/// retry budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StageOutcome {
    /// The stage did its work; its writes are committed.
    Success,
    /// The stage had nothing to do.
    Skipped(String),
    /// The stage failed; its writes are rolled back.
    Failed(String),
}

impl StageOutcome {
    /// Creates a skip outcome.
    #[must_use]
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skipped(reason.into())
    }

    /// Creates a failure outcome.
    #[must_use]
    pub fn fail(error: impl fmt::Display) -> Self {
        Self::Failed(error.to_string())
    }

    /// Folds a fallible stage body into an outcome; `Err` becomes a failure.
    #[must_use]
    pub fn from_result<E: fmt::Display>(result: Result<Self, E>) -> Self {
        result.unwrap_or_else(Self::fail)
    }

    /// Returns true on success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true on skip.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }

    /// Returns true on failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Short label used in the per-stage summary string.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "ok",
            Self::Skipped(_) => "skip",
            Self::Failed(_) => "fail",
        }
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("ok"),
            Self::Skipped(reason) => write!(f, "skip ({reason})"),
            Self::Failed(error) => write!(f, "fail ({error})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_result_maps_errors_to_failure() {
        let outcome = StageOutcome::from_result::<String>(Err("boom".to_string()));
        assert_eq!(outcome, StageOutcome::Failed("boom".to_string()));

        let outcome = StageOutcome::from_result::<String>(Ok(StageOutcome::skip("nothing")));
        assert!(outcome.is_skipped());
    }

    #[test]
    fn test_labels() {
        assert_eq!(StageOutcome::Success.label(), "ok");
        assert_eq!(StageOutcome::skip("x").label(), "skip");
        assert_eq!(StageOutcome::fail("x").label(), "fail");
    }

    #[test]
    fn test_serialize_tagged() {
        let json = serde_json::to_value(StageOutcome::fail("timeout")).unwrap();
        assert_eq!(json, serde_json::json!({"status": "failed", "detail": "timeout"}));
    }
}
