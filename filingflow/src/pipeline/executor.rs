//! Sequential stage executor.
//!
//! Runs an ordered list of stages against one filing inside the caller's
//! unit of work. Each stage's writes are bracketed by a stage savepoint:
//! kept on success, rolled back on skip or failure. A panicking stage counts
//! as failed. A failing stage never stops later stages; only a gate stage's
//! skip ends the run early.

use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::rollup::{rollup, summary_line, RunStatus};
use super::StageSpec;
use crate::config::PipelineConfig;
use crate::core::{Filing, StageOutcome, TaskOutcome};
use crate::dlq::DeadLetterStore;
use crate::errors::{panic_message, StoreError};
use crate::metrics::MetricsRecorder;
use crate::stages::{FilingWorkspace, StageContext, StageResult};
use crate::store::{FilingRepository, Session, UnitOfWork};

/// Result label recorded when a run aborts on an infrastructure error.
pub const ERROR_RESULT: &str = "error";

/// Everything one run produced.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    /// One result per executed stage, in run order.
    pub results: Vec<StageResult>,
    /// Rolled-up status, already persisted.
    pub status: RunStatus,
    /// Dead letters recorded in the caller's unit of work.
    pub dead_letters: usize,
}

impl PipelineRun {
    /// Per-stage summary, e.g. `ingest_chunks=ok, extract_tables=fail`.
    #[must_use]
    pub fn summary(&self) -> String {
        summary_line(&self.results)
    }

    /// Result for the stage named `name`, if it ran.
    #[must_use]
    pub fn result(&self, name: &str) -> Option<&StageResult> {
        self.results.iter().find(|r| r.name == name)
    }
}

/// Runs a validated stage list. Build one with
/// [`PipelineBuilder`](super::PipelineBuilder).
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    name: String,
    stages: Vec<StageSpec>,
    metrics: Arc<dyn MetricsRecorder>,
    dead_letters: DeadLetterStore,
}

impl PipelineExecutor {
    pub(crate) fn new(
        name: String,
        stages: Vec<StageSpec>,
        metrics: Arc<dyn MetricsRecorder>,
        dead_letters: DeadLetterStore,
    ) -> Self {
        Self {
            name,
            stages,
            metrics,
            dead_letters,
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stages in run order.
    #[must_use]
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Runs every stage against `filing` and persists the final status once.
    ///
    /// Stage failures are captured in the returned results. An `Err` means
    /// the unit of work itself failed; the caller should roll it back.
    /// Exactly one latency observation and one result count are emitted
    /// per call, whatever the outcome.
    pub async fn run(
        &self,
        session: &mut dyn Session,
        filing: &Filing,
        config: &PipelineConfig,
    ) -> Result<PipelineRun, StoreError> {
        let started = Instant::now();
        let result = self.run_stages(session, filing, config).await;

        self.metrics
            .observe_stage_latency(&self.name, started.elapsed());
        let label = match &result {
            Ok(run) => run.status.outcome.as_str(),
            Err(_) => ERROR_RESULT,
        };
        self.metrics.increment_stage_result(&self.name, label);

        result
    }

    async fn run_stages(
        &self,
        session: &mut dyn Session,
        filing: &Filing,
        config: &PipelineConfig,
    ) -> Result<PipelineRun, StoreError> {
        let mut workspace = FilingWorkspace::new();
        let mut results = Vec::with_capacity(self.stages.len());
        let mut dead_letters = 0;

        for spec in &self.stages {
            let started_at = Utc::now();
            session.begin_stage().await?;

            let (outcome, deferred) = {
                let mut ctx = StageContext::new(filing, &mut workspace, &mut *session, config);
                let outcome = match AssertUnwindSafe(spec.runner.execute(&mut ctx))
                    .catch_unwind()
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(payload) => StageOutcome::fail(format!(
                        "stage panicked: {}",
                        panic_message(&*payload)
                    )),
                };
                (outcome, ctx.take_dead_letters())
            };

            match &outcome {
                StageOutcome::Success => {
                    session.commit_stage().await?;
                    debug!(filing_id = %filing.id, stage = %spec.name, "Stage succeeded");
                }
                StageOutcome::Skipped(reason) => {
                    session.rollback_stage().await?;
                    info!(filing_id = %filing.id, stage = %spec.name, reason = %reason, "Stage skipped");
                }
                StageOutcome::Failed(message) => {
                    session.rollback_stage().await?;
                    self.metrics.increment_error(&spec.name, "stage_failure");
                    if spec.critical {
                        error!(
                            filing_id = %filing.id,
                            stage = %spec.name,
                            error = %message,
                            "Critical stage failed"
                        );
                    } else {
                        warn!(
                            filing_id = %filing.id,
                            stage = %spec.name,
                            error = %message,
                            "Stage failed"
                        );
                    }
                }
            }

            for dead_letter in deferred {
                self.dead_letters.record(&mut *session, dead_letter).await?;
                dead_letters += 1;
            }

            let stop = spec.gate && outcome.is_skipped();
            results.push(StageResult::new(
                spec.name.clone(),
                spec.critical,
                outcome,
                started_at,
            ));
            if stop {
                info!(
                    filing_id = %filing.id,
                    stage = %spec.name,
                    "Nothing to process, remaining stages not run"
                );
                break;
            }
        }

        let status = rollup(&results);
        session
            .set_filing_status(&filing.id, status.filing, status.analysis)
            .await?;

        let run = PipelineRun {
            results,
            status,
            dead_letters,
        };
        log_outcome(filing, &run);
        Ok(run)
    }
}

fn log_outcome(filing: &Filing, run: &PipelineRun) {
    let summary = run.summary();
    let corp_code = filing.corp_code.as_deref().unwrap_or("");
    let ticker = filing.ticker.as_deref().unwrap_or("");
    match run.status.outcome {
        TaskOutcome::Failed => error!(
            filing_id = %filing.id,
            corp_code,
            ticker,
            outcome = %run.status.outcome,
            stages = %summary,
            "Filing processing failed"
        ),
        TaskOutcome::Partial => warn!(
            filing_id = %filing.id,
            corp_code,
            ticker,
            outcome = %run.status.outcome,
            stages = %summary,
            "Filing processed with failures"
        ),
        _ => info!(
            filing_id = %filing.id,
            corp_code,
            ticker,
            outcome = %run.status.outcome,
            stages = %summary,
            "Filing processed"
        ),
    }
}
