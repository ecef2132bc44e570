//! Task entry points.
//!
//! Each entry point owns one unit of work for its whole lifetime: it opens
//! a session, does its work through it, commits on success, and rolls back
//! before surfacing any failure. Failures are handed to the
//! [`FailureClassifier`], which retries or dead-letters them. A panic inside
//! an entry point is treated as a transient failure.

mod message;

pub use message::{
    TaskMessage, DEFAULT_DAYS_BACK, EXTRACT_TABLES_TASK, PROCESS_FILING, SEED_RECENT_FILINGS,
    SYNC_METADATA, SYNC_PRICES,
};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::collaborators::Collaborators;
use crate::config::PipelineConfig;
use crate::core::{Correlation, TaskOutcome};
use crate::dlq::DeadLetterStore;
use crate::errors::{panic_message, IngestError, StoreError, TaskError};
use crate::metrics::MetricsRecorder;
use crate::pipeline::{filing_pipeline, PipelineExecutor};
use crate::retry::{FailureClassifier, PostPersistHook, RetryScheduler};
use crate::stages::TABLE_EXTRACTION_TASK;
use crate::store::{FilingRepository, Session, SessionFactory, UnitOfWork};

/// Whether [`Tasks::dispatch`] routes `task_name`.
#[must_use]
pub fn is_dispatchable(task_name: &str) -> bool {
    matches!(
        task_name,
        PROCESS_FILING
            | SEED_RECENT_FILINGS
            | SYNC_PRICES
            | SYNC_METADATA
            | EXTRACT_TABLES_TASK
            | TABLE_EXTRACTION_TASK
    )
}

/// What a successful task invocation returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    /// Task that ran.
    pub task_name: String,
    /// Outcome label.
    pub outcome: TaskOutcome,
    /// Rows or filings affected, for batch tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    /// Per-stage summary, for pipeline runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl TaskReport {
    fn new(task_name: &str, outcome: TaskOutcome) -> Self {
        Self {
            task_name: task_name.to_string(),
            outcome,
            count: None,
            summary: None,
        }
    }

    fn counted(task_name: &str, count: usize) -> Self {
        Self {
            count: Some(count),
            ..Self::new(task_name, TaskOutcome::Completed)
        }
    }
}

impl fmt::Display for TaskReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.task_name, self.outcome)?;
        if let Some(count) = self.count {
            write!(f, " ({count})")?;
        }
        if let Some(summary) = &self.summary {
            write!(f, " [{summary}]")?;
        }
        Ok(())
    }
}

/// The task entry points, wired to their collaborators.
#[derive(Clone)]
pub struct Tasks {
    collaborators: Collaborators,
    sessions: Arc<dyn SessionFactory>,
    pipeline: PipelineExecutor,
    classifier: FailureClassifier,
    dead_letters: DeadLetterStore,
    config: PipelineConfig,
}

impl Tasks {
    /// Wires the entry points.
    #[must_use]
    pub fn new(
        collaborators: Collaborators,
        sessions: Arc<dyn SessionFactory>,
        scheduler: Arc<dyn RetryScheduler>,
        metrics: Arc<dyn MetricsRecorder>,
        config: PipelineConfig,
    ) -> Self {
        let dead_letters = DeadLetterStore::from_config(&config.dead_letter, Arc::clone(&metrics));
        let pipeline = filing_pipeline(&collaborators, Arc::clone(&metrics), dead_letters.clone());
        let classifier = FailureClassifier::new(
            config.retry_policy(),
            scheduler,
            Arc::clone(&sessions),
            dead_letters.clone(),
            metrics,
        );
        Self {
            collaborators,
            sessions,
            pipeline,
            classifier,
            dead_letters,
            config,
        }
    }

    /// Installs a hook run after every dead letter is recorded.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn PostPersistHook>) -> Self {
        self.classifier = self.classifier.with_hook(hook);
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns the dead-letter store.
    #[must_use]
    pub fn dead_letters(&self) -> &DeadLetterStore {
        &self.dead_letters
    }

    /// Returns the session factory.
    #[must_use]
    pub fn sessions(&self) -> &Arc<dyn SessionFactory> {
        &self.sessions
    }

    /// Processes one filing.
    ///
    /// # Errors
    ///
    /// See [`Tasks::dispatch`].
    pub async fn process_filing(&self, filing_id: &str) -> Result<TaskReport, TaskError> {
        self.dispatch(&TaskMessage::process_filing(filing_id)).await
    }

    /// Pulls filings from the last `days_back` days.
    ///
    /// # Errors
    ///
    /// See [`Tasks::dispatch`].
    pub async fn seed_recent_filings(&self, days_back: u32) -> Result<TaskReport, TaskError> {
        self.dispatch(&TaskMessage::seed_recent_filings(days_back))
            .await
    }

    /// Syncs prices for the last `days_back` days.
    ///
    /// # Errors
    ///
    /// See [`Tasks::dispatch`].
    pub async fn sync_prices(&self, days_back: u32) -> Result<TaskReport, TaskError> {
        self.dispatch(&TaskMessage::sync_prices(days_back)).await
    }

    /// Syncs listing metadata.
    ///
    /// # Errors
    ///
    /// See [`Tasks::dispatch`].
    pub async fn sync_metadata(&self) -> Result<TaskReport, TaskError> {
        self.dispatch(&TaskMessage::sync_metadata()).await
    }

    /// Reruns table extraction for one filing.
    ///
    /// # Errors
    ///
    /// See [`Tasks::dispatch`].
    pub async fn extract_tables(&self, filing_id: &str) -> Result<TaskReport, TaskError> {
        self.dispatch(&TaskMessage::extract_tables(filing_id)).await
    }

    /// Routes a message to its entry point.
    ///
    /// When a message requeued from a dead letter succeeds, that entry is
    /// marked completed.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::UnknownTask`] or [`TaskError::InvalidPayload`]
    /// for undeliverable messages, and the classifier's verdict for
    /// failures.
    pub async fn dispatch(&self, message: &TaskMessage) -> Result<TaskReport, TaskError> {
        let report = match message.task_name.as_str() {
            PROCESS_FILING => {
                let filing_id = message.str_arg("filing_id")?;
                self.run_process_filing(message, &filing_id).await
            }
            SEED_RECENT_FILINGS => {
                let days_back = message.u32_arg("days_back", DEFAULT_DAYS_BACK)?;
                self.run_seed(message, days_back).await
            }
            SYNC_PRICES => {
                let days_back = message.u32_arg("days_back", DEFAULT_DAYS_BACK)?;
                self.run_sync_prices(message, days_back).await
            }
            SYNC_METADATA => self.run_sync_metadata(message).await,
            EXTRACT_TABLES_TASK | TABLE_EXTRACTION_TASK => {
                let filing_id = message.str_arg("filing_id")?;
                self.run_extract_tables(message, &filing_id).await
            }
            other => return Err(TaskError::UnknownTask(other.to_string())),
        }?;

        info!(
            task = %message.task_name,
            attempt = message.attempt,
            outcome = %report.outcome,
            "Task finished"
        );
        if let Some(id) = message.dead_letter_id {
            self.settle_dead_letter(id).await;
        }
        Ok(report)
    }

    async fn run_process_filing(
        &self,
        message: &TaskMessage,
        filing_id: &str,
    ) -> Result<TaskReport, TaskError> {
        let mut correlation = Correlation::for_receipt(filing_id);
        let result = guarded(async {
            let mut session = self.sessions.open().await?;
            let result = self
                .process_in(session.as_mut(), filing_id, &mut correlation)
                .await;
            close(session, result).await
        })
        .await;
        match result {
            Ok((report, dead_letters)) => {
                if dead_letters > 0 {
                    self.dead_letters
                        .refresh_committed(self.sessions.as_ref())
                        .await;
                }
                Ok(report)
            }
            Err(err) => Err(self.classifier.handle(message, err, &correlation).await),
        }
    }

    /// Returns the report and the number of dead letters the run recorded.
    async fn process_in(
        &self,
        session: &mut dyn Session,
        filing_id: &str,
        correlation: &mut Correlation,
    ) -> Result<(TaskReport, usize), IngestError> {
        let Some(filing) = session.load_filing(filing_id).await? else {
            warn!(filing_id, "Filing not found");
            return Ok((TaskReport::new(PROCESS_FILING, TaskOutcome::Missing), 0));
        };
        *correlation = filing.correlation();

        let run = self.pipeline.run(session, &filing, &self.config).await?;
        let report = TaskReport {
            summary: Some(run.summary()),
            ..TaskReport::new(PROCESS_FILING, run.status.outcome)
        };
        Ok((report, run.dead_letters))
    }

    async fn run_seed(&self, message: &TaskMessage, days_back: u32) -> Result<TaskReport, TaskError> {
        let result = guarded(async {
            let filings = self.collaborators.feed.fetch_recent(days_back).await?;
            let mut session = self.sessions.open().await?;
            let result = async {
                let mut inserted = 0usize;
                for filing in &filings {
                    if session.upsert_filing(filing).await? {
                        inserted += 1;
                    }
                }
                Ok::<_, StoreError>(inserted)
            }
            .await
            .map_err(IngestError::from);
            let inserted = close(session, result).await?;
            info!(days_back, fetched = filings.len(), inserted, "Seeded recent filings");
            Ok::<_, IngestError>(inserted)
        })
        .await;
        match result {
            Ok(inserted) => Ok(TaskReport::counted(SEED_RECENT_FILINGS, inserted)),
            Err(err) => Err(self
                .classifier
                .handle(message, err, &Correlation::default())
                .await),
        }
    }

    async fn run_sync_prices(
        &self,
        message: &TaskMessage,
        days_back: u32,
    ) -> Result<TaskReport, TaskError> {
        let result = guarded(async {
            Ok::<_, IngestError>(self.collaborators.market.sync_prices(days_back).await?)
        })
        .await;
        match result {
            Ok(rows) => Ok(TaskReport::counted(SYNC_PRICES, rows)),
            Err(err) => Err(self
                .classifier
                .handle(message, err, &Correlation::default())
                .await),
        }
    }

    async fn run_sync_metadata(&self, message: &TaskMessage) -> Result<TaskReport, TaskError> {
        let result = guarded(async {
            Ok::<_, IngestError>(self.collaborators.market.sync_metadata().await?)
        })
        .await;
        match result {
            Ok(rows) => Ok(TaskReport::counted(SYNC_METADATA, rows)),
            Err(err) => Err(self
                .classifier
                .handle(message, err, &Correlation::default())
                .await),
        }
    }

    async fn run_extract_tables(
        &self,
        message: &TaskMessage,
        filing_id: &str,
    ) -> Result<TaskReport, TaskError> {
        let mut correlation = Correlation::for_receipt(filing_id);
        let result = guarded(async {
            let mut session = self.sessions.open().await?;
            let result = self
                .extract_tables_in(session.as_mut(), filing_id, &mut correlation)
                .await;
            close(session, result).await
        })
        .await;
        match result {
            Ok(report) => Ok(report),
            Err(err) => Err(self.classifier.handle(message, err, &correlation).await),
        }
    }

    async fn extract_tables_in(
        &self,
        session: &mut dyn Session,
        filing_id: &str,
        correlation: &mut Correlation,
    ) -> Result<TaskReport, IngestError> {
        let Some(filing) = session.load_filing(filing_id).await? else {
            warn!(filing_id, "Filing not found");
            return Ok(TaskReport::new(EXTRACT_TABLES_TASK, TaskOutcome::Missing));
        };
        *correlation = filing.correlation();
        let Some(path) = filing.source_path.as_deref() else {
            info!(filing_id, "Filing has no source path, tables not extracted");
            return Ok(TaskReport::new(EXTRACT_TABLES_TASK, TaskOutcome::Skipped));
        };

        // Table failures are never retried.
        let extraction = self
            .collaborators
            .tables
            .extract_tables(&filing, path)
            .await
            .map_err(|err| IngestError::fatal(err.to_string()))?;

        let summary = json!({
            "stored": extraction.stored,
            "deleted": extraction.deleted,
            "elapsed_ms": extraction.elapsed_ms,
        });
        session.save_artifact(filing_id, "tables", &summary).await?;
        Ok(TaskReport::counted(
            EXTRACT_TABLES_TASK,
            extraction.stored as usize,
        ))
    }

    async fn settle_dead_letter(&self, id: Uuid) {
        let result = async {
            let mut session = self.sessions.open().await?;
            let result = async {
                match self.dead_letters.get(session.as_mut(), id).await? {
                    Some(mut entry) => {
                        self.dead_letters
                            .mark_completed(session.as_mut(), &mut entry)
                            .await
                    }
                    None => Err(StoreError::NotFound(format!("dead letter {id}"))),
                }
            }
            .await;
            close(session, result.map_err(IngestError::from)).await
        }
        .await;
        match result {
            Ok(()) => {
                info!(dead_letter_id = %id, "Dead letter completed");
                self.dead_letters
                    .refresh_committed(self.sessions.as_ref())
                    .await;
            }
            Err(err) => warn!(dead_letter_id = %id, error = %err, "Could not complete dead letter"),
        }
    }
}

impl fmt::Debug for Tasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tasks")
            .field("pipeline", &self.pipeline.name())
            .field("classifier", &self.classifier)
            .finish_non_exhaustive()
    }
}

/// Runs one entry point's work, turning a panic into a transient failure.
/// A session held by the work is dropped during unwinding, which discards
/// its writes.
async fn guarded<T>(
    work: impl Future<Output = Result<T, IngestError>>,
) -> Result<T, IngestError> {
    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(&*payload);
            error!(panic = %message, "Task panicked");
            Err(IngestError::transient(format!("task panicked: {message}")))
        }
    }
}

/// Commits on success, rolls back on failure. The session is consumed
/// either way.
async fn close<T>(
    mut session: Box<dyn Session>,
    result: Result<T, IngestError>,
) -> Result<T, IngestError> {
    match result {
        Ok(value) => {
            session.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = session.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}
