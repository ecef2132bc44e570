//! Sample data and a task harness over the in-memory store.

use std::sync::Arc;

use super::mocks::{
    RecordingNotifier, StaticAnalyzer, StaticExtractor, StaticFeed, StaticMarket, StaticOcr,
    StaticTables,
};
use crate::collaborators::{Collaborators, TableExtraction};
use crate::config::PipelineConfig;
use crate::core::{Chunk, Filing};
use crate::errors::TaskError;
use crate::metrics::InMemoryMetrics;
use crate::retry::RecordingRetryScheduler;
use crate::store::MemoryStore;
use crate::tasks::{TaskReport, Tasks};

/// A text chunk long enough that OCR is not needed.
#[must_use]
pub fn sample_chunk() -> Chunk {
    Chunk::text(
        "Operating profit rose 12% year over year on stronger memory pricing. ".repeat(4),
        "report.pdf",
    )
    .on_page(1)
}

/// A filing with correlation fields and a source path.
#[must_use]
pub fn sample_filing(id: &str) -> Filing {
    Filing::new(id)
        .with_corp_code("00126380")
        .with_ticker("005930")
        .with_title("Quarterly report")
        .with_source_path(format!("/filings/{id}"))
}

/// `n` sample filings with ids `S-0`, `S-1`, ...
#[must_use]
pub fn sample_filings(n: usize) -> Vec<Filing> {
    (0..n).map(|i| sample_filing(&format!("S-{i}"))).collect()
}

/// Collaborators that all succeed.
#[must_use]
pub fn collaborators() -> Collaborators {
    Collaborators {
        extractor: Arc::new(StaticExtractor::new(vec![sample_chunk()])),
        ocr: Arc::new(StaticOcr::new(Vec::new())),
        tables: Arc::new(StaticTables::new(TableExtraction {
            stored: 2,
            deleted: 0,
            elapsed_ms: 12,
            chunks: vec![Chunk::text("| revenue | 100 |", "report.pdf").with_kind("table")],
        })),
        analyzer: Arc::new(StaticAnalyzer::default()),
        notifier: Arc::new(RecordingNotifier::default()),
        feed: Arc::new(StaticFeed::new(sample_filings(2))),
        market: Arc::new(StaticMarket::new(30, 5)),
    }
}

/// [`Tasks`] wired over a [`MemoryStore`], in-memory metrics, and a
/// recording retry scheduler.
#[derive(Debug, Clone)]
pub struct Harness {
    /// Backing store.
    pub store: MemoryStore,
    /// Captured metrics.
    pub metrics: Arc<InMemoryMetrics>,
    /// Captured retries.
    pub scheduler: Arc<RecordingRetryScheduler>,
    /// The entry points under test.
    pub tasks: Tasks,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    /// Harness with succeeding collaborators and default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_collaborators(collaborators())
    }

    /// Harness with the given collaborators.
    #[must_use]
    pub fn with_collaborators(collaborators: Collaborators) -> Self {
        Self::with_config(collaborators, PipelineConfig::default())
    }

    /// Harness with the given collaborators and configuration.
    #[must_use]
    pub fn with_config(collaborators: Collaborators, config: PipelineConfig) -> Self {
        Self::build(
            MemoryStore::new(),
            Arc::new(InMemoryMetrics::new()),
            Arc::new(RecordingRetryScheduler::new()),
            collaborators,
            config,
        )
    }

    /// Harness sharing `other`'s store, metrics, and scheduler but using
    /// different collaborators.
    #[must_use]
    pub fn sharing(other: &Self, collaborators: Collaborators) -> Self {
        Self::build(
            other.store.clone(),
            Arc::clone(&other.metrics),
            Arc::clone(&other.scheduler),
            collaborators,
            other.tasks.config().clone(),
        )
    }

    fn build(
        store: MemoryStore,
        metrics: Arc<InMemoryMetrics>,
        scheduler: Arc<RecordingRetryScheduler>,
        collaborators: Collaborators,
        config: PipelineConfig,
    ) -> Self {
        let tasks = Tasks::new(
            collaborators,
            Arc::new(store.clone()),
            scheduler.clone(),
            metrics.clone(),
            config,
        );
        Self {
            store,
            metrics,
            scheduler,
            tasks,
        }
    }

    /// Inserts [`sample_filing`] under `id` and returns it.
    pub fn insert_sample_filing(&self, id: &str) -> Filing {
        let filing = sample_filing(id);
        self.store.insert_filing(filing.clone());
        filing
    }

    /// Redelivers scheduled retries, oldest first, until none remain.
    ///
    /// Delays are ignored. Returns every redelivery's result in order.
    pub async fn drain_retries(&self) -> Vec<Result<TaskReport, TaskError>> {
        let mut results = Vec::new();
        while let Some(retry) = self.scheduler.pop_front() {
            results.push(self.tasks.dispatch(&retry.message).await);
        }
        results
    }
}
