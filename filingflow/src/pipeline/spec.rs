//! Stage specifications.

use crate::errors::PipelineValidationError;
use crate::stages::Stage;
use std::sync::Arc;

/// Specification for a single stage in a pipeline.
///
/// The executor runs specs strictly in order. A `critical` stage's failure
/// makes the whole run FAILED. A `gate` stage's skip ends the run: later
/// stages would only see empty input.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// The stage implementation.
    pub runner: Arc<dyn Stage>,
    /// Whether a failure fails the whole run.
    pub critical: bool,
    /// Whether a skip stops the remaining stages.
    pub gate: bool,
}

impl StageSpec {
    /// Creates a non-critical stage specification named after its runner.
    #[must_use]
    pub fn new(runner: Arc<dyn Stage>) -> Self {
        Self {
            name: runner.name().to_string(),
            runner,
            critical: false,
            gate: false,
        }
    }

    /// Creates a specification under an explicit name.
    #[must_use]
    pub fn named(name: impl Into<String>, runner: Arc<dyn Stage>) -> Self {
        Self {
            name: name.into(),
            runner,
            critical: false,
            gate: false,
        }
    }

    /// Marks the stage as critical.
    #[must_use]
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Marks the stage as a gate.
    #[must_use]
    pub fn gate(mut self) -> Self {
        self.gate = true;
        self
    }

    /// Validates the stage specification.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty or whitespace-only.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new(
                "Stage name cannot be empty or whitespace-only",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageOutcome;
    use crate::stages::FnStage;

    #[test]
    fn test_stage_spec_creation() {
        let runner = Arc::new(FnStage::new("ingest_chunks", |_| StageOutcome::Success));
        let spec = StageSpec::new(runner).critical().gate();

        assert_eq!(spec.name, "ingest_chunks");
        assert!(spec.critical);
        assert!(spec.gate);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_blank_name_rejected() {
        let runner = Arc::new(FnStage::new("x", |_| StageOutcome::Success));
        let spec = StageSpec::named("  ", runner);
        assert!(spec.validate().is_err());
    }
}
