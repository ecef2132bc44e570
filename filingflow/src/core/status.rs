//! Filing status, analysis status, and task outcome enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a filing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilingStatus {
    /// Not processed yet.
    #[default]
    Pending,
    /// Every stage succeeded.
    Completed,
    /// A critical stage failed.
    Failed,
    /// A non-critical stage failed, or a stage skipped.
    Partial,
}

impl FilingStatus {
    /// Returns the persisted representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Partial => "PARTIAL",
        }
    }
}

impl fmt::Display for FilingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "PARTIAL" => Ok(Self::Partial),
            other => Err(format!("unknown filing status '{other}'")),
        }
    }
}

/// Analysis status of a filing, tracked independently of [`FilingStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    /// Not analyzed yet.
    #[default]
    Pending,
    /// Every analysis stage succeeded.
    Analyzed,
    /// A critical stage failed.
    Failed,
    /// Analysis is incomplete.
    Partial,
}

impl AnalysisStatus {
    /// Returns the persisted representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Analyzed => "ANALYZED",
            Self::Failed => "FAILED",
            Self::Partial => "PARTIAL",
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "ANALYZED" => Ok(Self::Analyzed),
            "FAILED" => Ok(Self::Failed),
            "PARTIAL" => Ok(Self::Partial),
            other => Err(format!("unknown analysis status '{other}'")),
        }
    }
}

/// Short outcome label returned by task entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// All stages succeeded.
    Completed,
    /// Some non-critical stage failed.
    Partial,
    /// A critical stage failed.
    Failed,
    /// The document had nothing processable.
    Skipped,
    /// The target filing does not exist.
    Missing,
}

impl TaskOutcome {
    /// Returns the label string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Missing => "missing",
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
