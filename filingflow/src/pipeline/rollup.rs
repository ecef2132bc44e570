//! Derivation of a document's final status from its stage results.

use serde::{Deserialize, Serialize};

use crate::core::{AnalysisStatus, FilingStatus, TaskOutcome};
use crate::stages::StageResult;

/// Final status of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    /// Document status.
    pub filing: FilingStatus,
    /// Analysis status.
    pub analysis: AnalysisStatus,
    /// Outcome label returned by the task.
    pub outcome: TaskOutcome,
}

impl RunStatus {
    const SKIPPED: Self = Self {
        filing: FilingStatus::Partial,
        analysis: AnalysisStatus::Partial,
        outcome: TaskOutcome::Skipped,
    };

    const FAILED: Self = Self {
        filing: FilingStatus::Failed,
        analysis: AnalysisStatus::Failed,
        outcome: TaskOutcome::Failed,
    };

    const PARTIAL: Self = Self {
        filing: FilingStatus::Partial,
        analysis: AnalysisStatus::Partial,
        outcome: TaskOutcome::Partial,
    };

    const COMPLETED: Self = Self {
        filing: FilingStatus::Completed,
        analysis: AnalysisStatus::Analyzed,
        outcome: TaskOutcome::Completed,
    };
}

/// Classifies a batch of stage results.
///
/// Precedence: any skip, then any critical failure, then any non-critical
/// failure, then completed. An empty batch is completed.
#[must_use]
pub fn rollup(results: &[StageResult]) -> RunStatus {
    if results.iter().any(StageResult::skipped) {
        RunStatus::SKIPPED
    } else if results.iter().any(|r| r.critical && r.error().is_some()) {
        RunStatus::FAILED
    } else if results.iter().any(|r| r.error().is_some()) {
        RunStatus::PARTIAL
    } else {
        RunStatus::COMPLETED
    }
}

/// Formats `name=ok, name=fail, name=skip` for log lines.
#[must_use]
pub fn summary_line(results: &[StageResult]) -> String {
    results
        .iter()
        .map(|r| format!("{}={}", r.name, r.outcome.label()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageOutcome;
    use chrono::Utc;

    fn result(name: &str, critical: bool, outcome: StageOutcome) -> StageResult {
        StageResult::new(name, critical, outcome, Utc::now())
    }

    #[test]
    fn test_empty_is_completed() {
        assert_eq!(rollup(&[]).outcome, TaskOutcome::Completed);
    }

    #[test]
    fn test_skip_beats_critical_failure() {
        let results = vec![
            result("ingest_chunks", true, StageOutcome::fail("boom")),
            result("extract_tables", false, StageOutcome::skip("nothing")),
        ];
        let status = rollup(&results);
        assert_eq!(status.filing, FilingStatus::Partial);
        assert_eq!(status.analysis, AnalysisStatus::Partial);
        assert_eq!(status.outcome, TaskOutcome::Skipped);
    }

    #[test]
    fn test_critical_failure() {
        let results = vec![
            result("ingest_chunks", true, StageOutcome::fail("boom")),
            result("extract_facts", false, StageOutcome::fail("also")),
        ];
        assert_eq!(rollup(&results).filing, FilingStatus::Failed);
    }

    #[test]
    fn test_non_critical_failure() {
        let results = vec![
            result("ingest_chunks", true, StageOutcome::Success),
            result("extract_facts", false, StageOutcome::fail("also")),
        ];
        assert_eq!(rollup(&results).outcome, TaskOutcome::Partial);
    }

    #[test]
    fn test_summary_line() {
        let results = vec![
            result("ingest_chunks", true, StageOutcome::Success),
            result("classify_category", false, StageOutcome::fail("x")),
            result("extract_facts", false, StageOutcome::skip("y")),
        ];
        assert_eq!(
            summary_line(&results),
            "ingest_chunks=ok, classify_category=fail, extract_facts=skip"
        );
    }
}
