//! Pipeline building and execution.
//!
//! This module provides:
//! - Stage specifications
//! - Pipeline builder with validation
//! - The sequential executor and status rollup
//! - The standard filing pipeline

mod builder;
mod executor;
mod rollup;
mod spec;

#[cfg(test)]
mod integration_tests;

use std::sync::Arc;

pub use builder::{PipelineBuilder, PROCESS_FILING_METRIC};
pub use executor::{PipelineExecutor, PipelineRun, ERROR_RESULT};
pub use rollup::{rollup, summary_line, RunStatus};
pub use spec::StageSpec;

use crate::collaborators::Collaborators;
use crate::dlq::DeadLetterStore;
use crate::metrics::MetricsRecorder;
use crate::stages::{
    ClassifyCategoryStage, ExtractFactsStage, ExtractTablesStage, IngestChunksStage,
    SummarizeAndNotifyStage,
};

/// Assembles the standard five-stage filing pipeline.
///
/// `ingest_chunks` is critical and gates the run; the rest are non-critical.
#[must_use]
pub fn filing_pipeline(
    collaborators: &Collaborators,
    metrics: Arc<dyn MetricsRecorder>,
    dead_letters: DeadLetterStore,
) -> PipelineExecutor {
    let c = collaborators;
    let stages = vec![
        StageSpec::new(Arc::new(IngestChunksStage::new(
            Arc::clone(&c.extractor),
            Arc::clone(&c.ocr),
        )))
        .critical()
        .gate(),
        StageSpec::new(Arc::new(ExtractTablesStage::new(
            Arc::clone(&c.tables),
            Arc::clone(&metrics),
        ))),
        StageSpec::new(Arc::new(ClassifyCategoryStage::new(Arc::clone(&c.analyzer)))),
        StageSpec::new(Arc::new(ExtractFactsStage::new(Arc::clone(&c.analyzer)))),
        StageSpec::new(Arc::new(SummarizeAndNotifyStage::new(
            Arc::clone(&c.analyzer),
            Arc::clone(&c.notifier),
        ))),
    ];
    PipelineExecutor::new(
        PROCESS_FILING_METRIC.to_string(),
        stages,
        metrics,
        dead_letters,
    )
}
