//! Pipeline builder with validation.

use super::executor::PipelineExecutor;
use super::StageSpec;
use crate::dlq::DeadLetterStore;
use crate::errors::PipelineValidationError;
use crate::metrics::{MetricsRecorder, NoOpMetrics};
use crate::stages::Stage;
use std::sync::Arc;

/// Metric key the standard filing pipeline reports under.
pub const PROCESS_FILING_METRIC: &str = "process_filing";

/// Builder for creating validated pipelines.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    /// Name the run is keyed by in metrics.
    name: String,
    /// The stage specifications, in run order.
    stages: Vec<StageSpec>,
    /// Metrics sink.
    metrics: Arc<dyn MetricsRecorder>,
    /// Store for dead letters deferred by stages.
    dead_letters: Option<DeadLetterStore>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            metrics: Arc::new(NoOpMetrics),
            dead_letters: None,
        }
    }

    /// Sets the metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sets the dead-letter store. Defaults to one built on the metrics sink.
    #[must_use]
    pub fn with_dead_letter_store(mut self, store: DeadLetterStore) -> Self {
        self.dead_letters = Some(store);
        self
    }

    /// Appends a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or already used.
    pub fn stage(
        mut self,
        runner: Arc<dyn Stage>,
        critical: bool,
    ) -> Result<Self, PipelineValidationError> {
        let mut spec = StageSpec::new(runner);
        spec.critical = critical;
        self.add_stage_spec(spec)?;
        Ok(self)
    }

    /// Appends a stage specification.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or already used.
    pub fn add_stage_spec(&mut self, spec: StageSpec) -> Result<(), PipelineValidationError> {
        spec.validate()?;
        if self.stages.iter().any(|s| s.name == spec.name) {
            return Err(PipelineValidationError::new(format!(
                "Duplicate stage name '{}'",
                spec.name
            ))
            .with_stages(vec![spec.name]));
        }
        self.stages.push(spec);
        Ok(())
    }

    /// Builds the executor.
    ///
    /// # Errors
    ///
    /// Returns an error if the builder has no stages or the name is blank.
    pub fn build(self) -> Result<PipelineExecutor, PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new(
                "Pipeline name cannot be empty or whitespace-only",
            ));
        }
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages"));
        }
        let dead_letters = self
            .dead_letters
            .unwrap_or_else(|| DeadLetterStore::new(Arc::clone(&self.metrics)));
        Ok(PipelineExecutor::new(
            self.name,
            self.stages,
            self.metrics,
            dead_letters,
        ))
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageOutcome;
    use crate::stages::FnStage;

    fn stage(name: &str) -> Arc<dyn Stage> {
        Arc::new(FnStage::new(name, |_| StageOutcome::Success))
    }

    #[test]
    fn test_builder_keeps_order() {
        let executor = PipelineBuilder::new("process_filing")
            .stage(stage("a"), true)
            .unwrap()
            .stage(stage("b"), false)
            .unwrap()
            .build()
            .unwrap();
        let names: Vec<&str> = executor.stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(executor.stages()[0].critical);
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let err = PipelineBuilder::new("p")
            .stage(stage("a"), false)
            .unwrap()
            .stage(stage("a"), true)
            .unwrap_err();
        assert!(err.message.contains("Duplicate"));
        assert_eq!(err.stages, vec!["a".to_string()]);
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let err = PipelineBuilder::new("p").build().unwrap_err();
        assert!(err.message.contains("no stages"));
    }

    #[test]
    fn test_blank_pipeline_name_rejected() {
        let builder = PipelineBuilder::new(" ").stage(stage("a"), false).unwrap();
        assert_eq!(builder.stage_count(), 1);
        assert!(builder.build().is_err());
    }
}
