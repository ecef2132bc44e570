//! The standard filing stages.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Stage, StageContext};
use crate::collaborators::{Analyzer, Notifier, OcrExtractor, SourceExtractor, TableExtractor};
use crate::core::StageOutcome;
use crate::dlq::{payload_of, NewDeadLetter};
use crate::errors::CollaboratorError;
use crate::metrics::MetricsRecorder;
use crate::store::FilingRepository;

/// Source extraction stage.
pub const INGEST_CHUNKS: &str = "ingest_chunks";
/// Table extraction stage.
pub const EXTRACT_TABLES: &str = "extract_tables";
/// Category classification stage.
pub const CLASSIFY_CATEGORY: &str = "classify_category";
/// Fact extraction stage.
pub const EXTRACT_FACTS: &str = "extract_facts";
/// Summary and notification stage.
pub const SUMMARIZE_AND_NOTIFY: &str = "summarize_and_notify";
/// Task name recorded on table extraction dead letters.
pub const TABLE_EXTRACTION_TASK: &str = "table_extraction";

async fn save_artifact(ctx: &mut StageContext<'_>, kind: &str, value: &Value) -> anyhow::Result<()> {
    let filing_id = ctx.filing().id.clone();
    ctx.session().save_artifact(&filing_id, kind, value).await?;
    Ok(())
}

fn require_text(ctx: &StageContext<'_>) -> Result<String, CollaboratorError> {
    let text = ctx.workspace().combined_text();
    if text.is_empty() {
        Err(CollaboratorError::EmptyInput("no extracted text".into()))
    } else {
        Ok(text)
    }
}

/// Extracts source chunks, falling back to OCR when text is sparse.
///
/// Skips when the filing has no sources or nothing could be extracted.
#[derive(Clone)]
pub struct IngestChunksStage {
    extractor: Arc<dyn SourceExtractor>,
    ocr: Arc<dyn OcrExtractor>,
}

impl IngestChunksStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(extractor: Arc<dyn SourceExtractor>, ocr: Arc<dyn OcrExtractor>) -> Self {
        Self { extractor, ocr }
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<StageOutcome> {
        let Some(path) = ctx.filing().source_path.clone() else {
            return Ok(StageOutcome::skip("filing has no source path"));
        };

        let mut chunks = match self.extractor.extract(&path).await {
            Ok(chunks) => chunks,
            Err(CollaboratorError::NoSources(reason)) => {
                return Ok(StageOutcome::skip(format!("no source documents: {reason}")));
            }
            Err(err) => return Err(err.into()),
        };

        let text_len: usize = chunks.iter().map(|c| c.content.chars().count()).sum();
        let ocr = &ctx.config().ocr;
        if text_len < ocr.min_text_chars {
            let max_pages = ocr.max_pages;
            match self.ocr.extract_ocr(&path, max_pages).await {
                Ok(extra) => {
                    debug!(
                        filing_id = %ctx.filing().id,
                        text_len,
                        ocr_chunks = extra.len(),
                        "Applied OCR fallback"
                    );
                    chunks.extend(extra);
                }
                Err(err) => {
                    warn!(filing_id = %ctx.filing().id, error = %err, "OCR fallback failed");
                }
            }
        }

        if chunks.is_empty() {
            return Ok(StageOutcome::skip("no extractable content"));
        }

        save_artifact(ctx, "chunks", &serde_json::to_value(&chunks)?).await?;
        ctx.workspace_mut().chunks = chunks;
        Ok(StageOutcome::Success)
    }
}

impl std::fmt::Debug for IngestChunksStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestChunksStage").finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for IngestChunksStage {
    fn name(&self) -> &str {
        INGEST_CHUNKS
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> StageOutcome {
        StageOutcome::from_result(self.run(ctx).await)
    }
}

/// Extracts tables and appends them to the workspace.
///
/// A table extraction error is never retried: it is recorded as a dead
/// letter and the stage fails.
#[derive(Clone)]
pub struct ExtractTablesStage {
    tables: Arc<dyn TableExtractor>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl ExtractTablesStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(tables: Arc<dyn TableExtractor>, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self { tables, metrics }
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<StageOutcome> {
        let Some(path) = ctx.filing().source_path.clone() else {
            return Ok(StageOutcome::skip("filing has no source path"));
        };

        let extraction = match self.tables.extract_tables(ctx.filing(), &path).await {
            Ok(extraction) => extraction,
            Err(err) => {
                self.metrics.increment_error(EXTRACT_TABLES, TABLE_EXTRACTION_TASK);
                let filing = ctx.filing();
                let dead_letter = NewDeadLetter::new(
                    TABLE_EXTRACTION_TASK,
                    payload_of([("filing_id", json!(filing.id))]),
                    err.to_string(),
                )
                .with_correlation(filing.correlation());
                ctx.defer_dead_letter(dead_letter);
                return Ok(StageOutcome::fail(err));
            }
        };

        let summary = json!({
            "stored": extraction.stored,
            "deleted": extraction.deleted,
            "elapsed_ms": extraction.elapsed_ms,
        });
        save_artifact(ctx, "tables", &summary).await?;
        ctx.workspace_mut().chunks.extend(extraction.chunks);
        Ok(StageOutcome::Success)
    }
}

impl std::fmt::Debug for ExtractTablesStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractTablesStage").finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for ExtractTablesStage {
    fn name(&self) -> &str {
        EXTRACT_TABLES
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> StageOutcome {
        StageOutcome::from_result(self.run(ctx).await)
    }
}

/// Classifies the filing and stores the `category` artifact.
#[derive(Clone)]
pub struct ClassifyCategoryStage {
    analyzer: Arc<dyn Analyzer>,
}

impl ClassifyCategoryStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        Self { analyzer }
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<StageOutcome> {
        let text = require_text(ctx)?;
        let category = self.analyzer.classify(&text).await?;
        save_artifact(ctx, "category", &Value::Object(category)).await?;
        Ok(StageOutcome::Success)
    }
}

impl std::fmt::Debug for ClassifyCategoryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifyCategoryStage").finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for ClassifyCategoryStage {
    fn name(&self) -> &str {
        CLASSIFY_CATEGORY
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> StageOutcome {
        StageOutcome::from_result(self.run(ctx).await)
    }
}

/// Extracts key facts and stores the `facts` artifact.
#[derive(Clone)]
pub struct ExtractFactsStage {
    analyzer: Arc<dyn Analyzer>,
}

impl ExtractFactsStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        Self { analyzer }
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<StageOutcome> {
        let text = require_text(ctx)?;
        let facts = self.analyzer.extract_facts(&text).await?;
        save_artifact(ctx, "facts", &Value::Object(facts)).await?;
        Ok(StageOutcome::Success)
    }
}

impl std::fmt::Debug for ExtractFactsStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractFactsStage").finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for ExtractFactsStage {
    fn name(&self) -> &str {
        EXTRACT_FACTS
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> StageOutcome {
        StageOutcome::from_result(self.run(ctx).await)
    }
}

/// Summarizes, stores the `summary` artifact, then notifies.
#[derive(Clone)]
pub struct SummarizeAndNotifyStage {
    analyzer: Arc<dyn Analyzer>,
    notifier: Arc<dyn Notifier>,
}

impl SummarizeAndNotifyStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(analyzer: Arc<dyn Analyzer>, notifier: Arc<dyn Notifier>) -> Self {
        Self { analyzer, notifier }
    }

    async fn run(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<StageOutcome> {
        let text = require_text(ctx)?;
        let summary = self.analyzer.summarize(&text).await?;
        save_artifact(ctx, "summary", &Value::Object(summary.clone())).await?;
        self.notifier.notify(ctx.filing(), &summary).await?;
        Ok(StageOutcome::Success)
    }
}

impl std::fmt::Debug for SummarizeAndNotifyStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummarizeAndNotifyStage").finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for SummarizeAndNotifyStage {
    fn name(&self) -> &str {
        SUMMARIZE_AND_NOTIFY
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> StageOutcome {
        StageOutcome::from_result(self.run(ctx).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::core::{Chunk, Filing};
    use crate::metrics::InMemoryMetrics;
    use crate::stages::FilingWorkspace;
    use crate::store::MemoryStore;
    use crate::testing::{FailingTables, StaticAnalyzer, StaticExtractor, StaticOcr};

    struct Fixture {
        store: MemoryStore,
        config: PipelineConfig,
        filing: Filing,
        workspace: FilingWorkspace,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                config: PipelineConfig::default(),
                filing: Filing::new("R-1").with_source_path("/filings/R-1"),
                workspace: FilingWorkspace::new(),
            }
        }
    }

    fn long_text() -> String {
        "Operating profit increased. ".repeat(20)
    }

    #[tokio::test]
    async fn test_ingest_skips_without_source_path() {
        let mut fx = Fixture::new();
        fx.filing.source_path = None;
        let stage = IngestChunksStage::new(
            Arc::new(StaticExtractor::new(vec![])),
            Arc::new(StaticOcr::new(vec![])),
        );
        let mut session = fx.store.session();
        let mut ctx = StageContext::new(&fx.filing, &mut fx.workspace, &mut session, &fx.config);
        assert!(stage.execute(&mut ctx).await.is_skipped());
    }

    #[tokio::test]
    async fn test_ingest_skips_on_no_sources() {
        let mut fx = Fixture::new();
        let stage = IngestChunksStage::new(
            Arc::new(StaticExtractor::no_sources()),
            Arc::new(StaticOcr::new(vec![])),
        );
        let mut session = fx.store.session();
        let mut ctx = StageContext::new(&fx.filing, &mut fx.workspace, &mut session, &fx.config);
        let outcome = stage.execute(&mut ctx).await;
        assert!(outcome.is_skipped(), "{outcome}");
    }

    #[tokio::test]
    async fn test_ingest_skips_on_zero_chunks() {
        let mut fx = Fixture::new();
        let stage = IngestChunksStage::new(
            Arc::new(StaticExtractor::new(vec![])),
            Arc::new(StaticOcr::new(vec![])),
        );
        let mut session = fx.store.session();
        let mut ctx = StageContext::new(&fx.filing, &mut fx.workspace, &mut session, &fx.config);
        assert!(stage.execute(&mut ctx).await.is_skipped());
    }

    #[tokio::test]
    async fn test_ingest_uses_ocr_when_text_is_sparse() {
        let mut fx = Fixture::new();
        let stage = IngestChunksStage::new(
            Arc::new(StaticExtractor::new(vec![Chunk::text("short", "a.pdf")])),
            Arc::new(StaticOcr::new(vec![
                Chunk::text(long_text(), "a.pdf").with_kind("ocr").on_page(1)
            ])),
        );
        let mut session = fx.store.session();
        {
            let mut ctx =
                StageContext::new(&fx.filing, &mut fx.workspace, &mut session, &fx.config);
            assert!(stage.execute(&mut ctx).await.is_success());
        }
        assert_eq!(fx.workspace.chunks.len(), 2);
        let saved = session.load_artifact("R-1", "chunks").await.unwrap().unwrap();
        assert_eq!(saved.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ingest_ignores_ocr_failure() {
        let mut fx = Fixture::new();
        let stage = IngestChunksStage::new(
            Arc::new(StaticExtractor::new(vec![Chunk::text("short", "a.pdf")])),
            Arc::new(StaticOcr::failing()),
        );
        let mut session = fx.store.session();
        let mut ctx = StageContext::new(&fx.filing, &mut fx.workspace, &mut session, &fx.config);
        assert!(stage.execute(&mut ctx).await.is_success());
    }

    #[tokio::test]
    async fn test_ingest_fails_on_extractor_error() {
        let mut fx = Fixture::new();
        let stage = IngestChunksStage::new(
            Arc::new(StaticExtractor::failing("parser crashed")),
            Arc::new(StaticOcr::new(vec![])),
        );
        let mut session = fx.store.session();
        let mut ctx = StageContext::new(&fx.filing, &mut fx.workspace, &mut session, &fx.config);
        let outcome = stage.execute(&mut ctx).await;
        assert!(outcome.is_failure());
        assert!(outcome.to_string().contains("parser crashed"));
    }

    #[tokio::test]
    async fn test_table_failure_defers_dead_letter() {
        let mut fx = Fixture::new();
        let metrics = Arc::new(InMemoryMetrics::new());
        let stage = ExtractTablesStage::new(Arc::new(FailingTables::new("bad table")), metrics.clone());
        let mut session = fx.store.session();
        let mut ctx = StageContext::new(&fx.filing, &mut fx.workspace, &mut session, &fx.config);

        let outcome = stage.execute(&mut ctx).await;
        assert!(outcome.is_failure());
        let deferred = ctx.take_dead_letters();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].task_name, TABLE_EXTRACTION_TASK);
        assert_eq!(deferred[0].payload["filing_id"], json!("R-1"));
        assert_eq!(metrics.error_count(EXTRACT_TABLES, TABLE_EXTRACTION_TASK), 1);
    }

    #[tokio::test]
    async fn test_analysis_fails_on_empty_text() {
        let mut fx = Fixture::new();
        let stage = ClassifyCategoryStage::new(Arc::new(StaticAnalyzer::default()));
        let mut session = fx.store.session();
        let mut ctx = StageContext::new(&fx.filing, &mut fx.workspace, &mut session, &fx.config);
        let outcome = stage.execute(&mut ctx).await;
        assert!(outcome.is_failure());
        assert!(outcome.to_string().contains("empty input"));
    }

    #[tokio::test]
    async fn test_facts_saved() {
        let mut fx = Fixture::new();
        fx.workspace.chunks.push(Chunk::text(long_text(), "a.pdf"));
        let stage = ExtractFactsStage::new(Arc::new(StaticAnalyzer::default()));
        let mut session = fx.store.session();
        {
            let mut ctx =
                StageContext::new(&fx.filing, &mut fx.workspace, &mut session, &fx.config);
            assert!(stage.execute(&mut ctx).await.is_success());
        }
        assert!(session.load_artifact("R-1", "facts").await.unwrap().is_some());
    }
}
