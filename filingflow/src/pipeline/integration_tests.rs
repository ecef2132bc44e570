use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;
use crate::config::PipelineConfig;
use crate::core::{AnalysisStatus, Chunk, Filing, FilingStatus, StageOutcome, TaskOutcome};
use crate::dlq::{payload_of, NewDeadLetter};
use crate::metrics::InMemoryMetrics;
use crate::stages::{FnStage, Stage, StageContext, INGEST_CHUNKS};
use crate::store::{FilingRepository, MemoryStore, UnitOfWork};
use crate::testing::{self, StaticAnalyzer, StaticExtractor};

const STAGES: [&str; 5] = ["ingest", "tables", "classify", "facts", "summary"];

fn fixed(name: &'static str, outcome: StageOutcome) -> Arc<dyn Stage> {
    Arc::new(FnStage::new(name, move |_| outcome.clone()))
}

fn expected_for(failures: u32) -> TaskOutcome {
    if failures & 1 == 1 {
        TaskOutcome::Failed
    } else if failures != 0 {
        TaskOutcome::Partial
    } else {
        TaskOutcome::Completed
    }
}

async fn run_once(executor: &PipelineExecutor, store: &MemoryStore, filing: &Filing) -> PipelineRun {
    let mut session = store.session();
    let run = executor
        .run(&mut session, filing, &PipelineConfig::default())
        .await
        .unwrap();
    session.commit().await.unwrap();
    run
}

#[tokio::test]
async fn test_rollup_over_every_failure_combination() {
    for mask in 0u32..(1 << STAGES.len()) {
        let mut builder = PipelineBuilder::new("combo");
        for (i, name) in STAGES.iter().enumerate() {
            let outcome = if mask & (1 << i) != 0 {
                StageOutcome::fail(format!("{name} broke"))
            } else {
                StageOutcome::Success
            };
            builder = builder.stage(fixed(*name, outcome), i == 0).unwrap();
        }
        let executor = builder.build().unwrap();

        let store = MemoryStore::new();
        let filing = Filing::new(format!("R-{mask}"));
        store.insert_filing(filing.clone());

        let run = run_once(&executor, &store, &filing).await;
        let expected = expected_for(mask);
        assert_eq!(run.results.len(), STAGES.len(), "mask {mask:05b}");
        assert_eq!(run.status.outcome, expected, "mask {mask:05b}");

        let saved = store.filing(&filing.id).unwrap();
        assert_eq!(saved.status, run.status.filing, "mask {mask:05b}");
        assert_eq!(saved.analysis_status, run.status.analysis, "mask {mask:05b}");
    }
}

#[tokio::test]
async fn test_any_skip_wins_over_failures() {
    for mask in 0u32..(1 << STAGES.len()) {
        let mut builder = PipelineBuilder::new("combo");
        for (i, name) in STAGES.iter().enumerate() {
            let outcome = if i == 3 {
                StageOutcome::skip("nothing to do")
            } else if mask & (1 << i) != 0 {
                StageOutcome::fail("broke")
            } else {
                StageOutcome::Success
            };
            builder = builder.stage(fixed(*name, outcome), i == 0).unwrap();
        }
        let executor = builder.build().unwrap();
        let store = MemoryStore::new();
        let filing = Filing::new("R-skip");
        store.insert_filing(filing.clone());

        let run = run_once(&executor, &store, &filing).await;
        assert_eq!(run.status.outcome, TaskOutcome::Skipped, "mask {mask:05b}");
        assert_eq!(run.status.filing, FilingStatus::Partial);
        assert_eq!(run.status.analysis, AnalysisStatus::Partial);
    }
}

#[tokio::test]
async fn test_critical_failure_does_not_stop_later_stages() {
    let executor = PipelineBuilder::new("p")
        .stage(fixed("first", StageOutcome::fail("boom")), true)
        .unwrap()
        .stage(fixed("second", StageOutcome::Success), false)
        .unwrap()
        .build()
        .unwrap();
    let store = MemoryStore::new();
    let filing = Filing::new("R-1");
    store.insert_filing(filing.clone());

    let run = run_once(&executor, &store, &filing).await;
    assert_eq!(run.summary(), "first=fail, second=ok");
    assert_eq!(run.status.outcome, TaskOutcome::Failed);
}

#[tokio::test]
async fn test_no_chunks_short_circuits_the_filing_pipeline() {
    let analyzer = Arc::new(StaticAnalyzer::default());
    let mut collaborators = testing::collaborators();
    collaborators.extractor = Arc::new(StaticExtractor::new(vec![]));
    collaborators.analyzer = analyzer.clone();

    let metrics = Arc::new(InMemoryMetrics::new());
    let executor = filing_pipeline(
        &collaborators,
        metrics.clone(),
        DeadLetterStore::new(metrics.clone()),
    );
    let store = MemoryStore::new();
    let filing = testing::sample_filing("R-empty");
    store.insert_filing(filing.clone());

    let run = run_once(&executor, &store, &filing).await;

    assert_eq!(run.results.len(), 1);
    assert_eq!(run.results[0].name, INGEST_CHUNKS);
    assert!(run.results[0].skipped());
    assert_eq!(analyzer.calls(), 0);
    assert_eq!(run.status.filing, FilingStatus::Partial);
    assert_eq!(run.status.outcome, TaskOutcome::Skipped);
}

#[tokio::test]
async fn test_standard_pipeline_completes() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let executor = filing_pipeline(
        &testing::collaborators(),
        metrics.clone(),
        DeadLetterStore::new(metrics.clone()),
    );
    let store = MemoryStore::new();
    let filing = testing::sample_filing("R-ok");
    store.insert_filing(filing.clone());

    let run = run_once(&executor, &store, &filing).await;

    assert_eq!(
        run.summary(),
        "ingest_chunks=ok, extract_tables=ok, classify_category=ok, extract_facts=ok, summarize_and_notify=ok"
    );
    assert_eq!(run.status.outcome, TaskOutcome::Completed);
    assert!(store.artifact("R-ok", "chunks").is_some());
    assert!(store.artifact("R-ok", "summary").is_some());
    assert_eq!(metrics.latency_count(PROCESS_FILING_METRIC), 1);
    assert_eq!(metrics.result_count(PROCESS_FILING_METRIC, "completed"), 1);
    assert_eq!(metrics.total_results(PROCESS_FILING_METRIC), 1);
}

#[derive(Debug)]
struct WriteThen {
    name: &'static str,
    outcome: StageOutcome,
    dead_letter: bool,
}

#[async_trait]
impl Stage for WriteThen {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> StageOutcome {
        let id = ctx.filing().id.clone();
        if ctx
            .session()
            .save_artifact(&id, self.name, &json!({"by": self.name}))
            .await
            .is_err()
        {
            return StageOutcome::fail("write failed");
        }
        if self.dead_letter {
            ctx.defer_dead_letter(NewDeadLetter::new(
                "table_extraction",
                payload_of([("filing_id", json!(id))]),
                "tables broke",
            ));
        }
        self.outcome.clone()
    }
}

#[tokio::test]
async fn test_failed_stage_writes_are_undone_but_dead_letters_kept() {
    let executor = PipelineBuilder::new("p")
        .stage(
            Arc::new(WriteThen {
                name: "kept",
                outcome: StageOutcome::Success,
                dead_letter: false,
            }),
            true,
        )
        .unwrap()
        .stage(
            Arc::new(WriteThen {
                name: "undone",
                outcome: StageOutcome::fail("boom"),
                dead_letter: true,
            }),
            false,
        )
        .unwrap()
        .stage(
            Arc::new(WriteThen {
                name: "skipped",
                outcome: StageOutcome::skip("nothing"),
                dead_letter: false,
            }),
            false,
        )
        .unwrap()
        .build()
        .unwrap();
    let store = MemoryStore::new();
    let filing = Filing::new("R-2").with_corp_code("00126380");
    store.insert_filing(filing.clone());

    let run = run_once(&executor, &store, &filing).await;

    assert_eq!(run.dead_letters, 1);
    assert!(store.artifact("R-2", "kept").is_some());
    assert!(store.artifact("R-2", "undone").is_none());
    assert!(store.artifact("R-2", "skipped").is_none());
    let letters = store.dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].task_name, "table_extraction");
}

#[derive(Debug)]
struct WriteThenPanic;

#[async_trait]
impl Stage for WriteThenPanic {
    fn name(&self) -> &str {
        "tables"
    }

    async fn execute(&self, ctx: &mut StageContext<'_>) -> StageOutcome {
        let id = ctx.filing().id.clone();
        let _ = ctx.session().save_artifact(&id, "tables", &json!({})).await;
        panic!("index out of bounds");
    }
}

#[tokio::test]
async fn test_panicking_stage_is_recorded_as_failed() {
    let executor = PipelineBuilder::new("p")
        .stage(
            Arc::new(FnStage::new("a", |_| -> StageOutcome { panic!("bad row") })),
            false,
        )
        .unwrap()
        .stage(fixed("b", StageOutcome::Success), false)
        .unwrap()
        .build()
        .unwrap();
    let store = MemoryStore::new();
    let filing = Filing::new("R-P");
    store.insert_filing(filing.clone());

    let run = run_once(&executor, &store, &filing).await;
    assert_eq!(run.summary(), "a=fail, b=ok");
    assert_eq!(run.status.outcome, TaskOutcome::Partial);
    assert_eq!(
        run.results[0].outcome,
        StageOutcome::fail("stage panicked: bad row")
    );
}

#[tokio::test]
async fn test_panicking_stage_writes_are_undone() {
    let executor = PipelineBuilder::new("p")
        .stage(Arc::new(WriteThenPanic), false)
        .unwrap()
        .stage(fixed("after", StageOutcome::Success), false)
        .unwrap()
        .build()
        .unwrap();
    let store = MemoryStore::new();
    let filing = Filing::new("R-Q");
    store.insert_filing(filing.clone());

    let run = run_once(&executor, &store, &filing).await;
    assert_eq!(run.summary(), "tables=fail, after=ok");
    assert!(store.artifact("R-Q", "tables").is_none());
    assert_eq!(store.filing("R-Q").unwrap().status, FilingStatus::Partial);
}

#[tokio::test]
async fn test_gate_skip_stops_remaining_stages() {
    let mut builder = PipelineBuilder::new("p")
        .stage(fixed("a", StageOutcome::Success), false)
        .unwrap();
    builder
        .add_stage_spec(StageSpec::new(fixed("gate", StageOutcome::skip("empty"))).gate())
        .unwrap();
    let executor = builder
        .stage(fixed("never", StageOutcome::fail("ran")), true)
        .unwrap()
        .build()
        .unwrap();
    let store = MemoryStore::new();
    let filing = Filing::new("R-3");
    store.insert_filing(filing.clone());

    let run = run_once(&executor, &store, &filing).await;
    assert_eq!(run.summary(), "a=ok, gate=skip");
    assert!(run.result("never").is_none());
}

#[tokio::test]
async fn test_missing_filing_row_is_an_error_and_still_counted() {
    let metrics = Arc::new(InMemoryMetrics::new());
    let executor = PipelineBuilder::new("p")
        .with_metrics(metrics.clone())
        .stage(fixed("a", StageOutcome::Success), true)
        .unwrap()
        .build()
        .unwrap();
    let store = MemoryStore::new();
    let mut session = store.session();

    let result = executor
        .run(&mut session, &Filing::new("ghost"), &PipelineConfig::default())
        .await;

    assert!(result.is_err());
    assert_eq!(metrics.latency_count("p"), 1);
    assert_eq!(metrics.result_count("p", ERROR_RESULT), 1);
}

#[test]
fn test_sample_chunk_is_long_enough_to_skip_ocr() {
    let config = PipelineConfig::default();
    let chunk: Chunk = testing::sample_chunk();
    assert!(chunk.content.chars().count() >= config.ocr.min_text_chars);
}
