//! Task-level failure classification.
//!
//! Every task entry point hands its escaping failure to one
//! [`FailureClassifier`]. A failure is either rescheduled or dead-lettered,
//! never both.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{error, warn};

use super::{RetryDecision, RetryPolicy, RetryScheduler};
use crate::core::Correlation;
use crate::dlq::{DeadLetterEntry, DeadLetterStore, NewDeadLetter};
use crate::errors::{IngestError, TaskError};
use crate::metrics::MetricsRecorder;
use crate::store::SessionFactory;
use crate::tasks::TaskMessage;

/// Called after a dead letter has been durably recorded.
#[async_trait]
pub trait PostPersistHook: Send + Sync + fmt::Debug {
    /// Observes the recorded entry. Must not fail.
    async fn after_persist(&self, entry: &DeadLetterEntry);
}

/// Decides between retry and dead letter for a failed task invocation.
#[derive(Clone)]
pub struct FailureClassifier {
    policy: RetryPolicy,
    scheduler: Arc<dyn RetryScheduler>,
    sessions: Arc<dyn SessionFactory>,
    dead_letters: DeadLetterStore,
    metrics: Arc<dyn MetricsRecorder>,
    hook: Option<Arc<dyn PostPersistHook>>,
}

impl FailureClassifier {
    /// Creates a classifier.
    #[must_use]
    pub fn new(
        policy: RetryPolicy,
        scheduler: Arc<dyn RetryScheduler>,
        sessions: Arc<dyn SessionFactory>,
        dead_letters: DeadLetterStore,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            policy,
            scheduler,
            sessions,
            dead_letters,
            metrics,
            hook: None,
        }
    }

    /// Sets the post-persist hook.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn PostPersistHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Returns the retry policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Classifies a failure of `message`.
    ///
    /// A transient error within budget is rescheduled with exponential
    /// backoff. A transient error at the budget, a scheduling failure, or a
    /// fatal error is recorded as a dead letter in its own unit of work.
    /// The returned error is always surfaced to the runner.
    pub async fn handle(
        &self,
        message: &TaskMessage,
        error: IngestError,
        correlation: &Correlation,
    ) -> TaskError {
        self.metrics.increment_error(&message.task_name, error.kind());

        let fatal = match error {
            IngestError::Transient(cause) => match self.policy.decide(message.attempt) {
                RetryDecision::Retry {
                    next_attempt,
                    delay,
                } => {
                    let next = message.retry(next_attempt);
                    match self.scheduler.schedule(next, delay).await {
                        Ok(()) => {
                            self.metrics.increment_retry(&message.task_name);
                            warn!(
                                task = %message.task_name,
                                attempt = message.attempt,
                                delay_secs = delay.as_secs(),
                                receipt_no = correlation.receipt_no.as_deref().unwrap_or(""),
                                error = %cause,
                                "Transient failure, retry scheduled"
                            );
                            return TaskError::RetryScheduled {
                                attempt: next_attempt,
                                delay,
                                cause: IngestError::Transient(cause),
                            };
                        }
                        Err(schedule_err) => {
                            error!(
                                task = %message.task_name,
                                attempt = message.attempt,
                                error = %schedule_err,
                                "Retry could not be scheduled"
                            );
                            IngestError::fatal(format!(
                                "{cause} (retry not scheduled: {schedule_err})"
                            ))
                        }
                    }
                }
                RetryDecision::GiveUp => IngestError::Transient(cause).escalate(),
            },
            fatal @ IngestError::Fatal(_) => fatal,
        };

        self.dead_letter(message, fatal, correlation).await
    }

    async fn dead_letter(
        &self,
        message: &TaskMessage,
        error: IngestError,
        correlation: &Correlation,
    ) -> TaskError {
        let new = NewDeadLetter::new(
            message.task_name.clone(),
            message.payload.clone(),
            error.message(),
        )
        .with_retries(i64::from(message.attempt))
        .with_correlation(correlation.clone());

        match self
            .dead_letters
            .record_standalone(self.sessions.as_ref(), new)
            .await
        {
            Ok(entry) => {
                error!(
                    task = %message.task_name,
                    attempt = message.attempt,
                    dead_letter_id = %entry.id,
                    receipt_no = entry.receipt_no.as_deref().unwrap_or(""),
                    corp_code = entry.corp_code.as_deref().unwrap_or(""),
                    ticker = entry.ticker.as_deref().unwrap_or(""),
                    error = %error,
                    "Task dead-lettered"
                );
                if let Some(hook) = &self.hook {
                    hook.after_persist(&entry).await;
                }
                TaskError::Fatal {
                    error,
                    dead_letter_id: Some(entry.id),
                }
            }
            Err(store_err) => {
                error!(
                    task = %message.task_name,
                    attempt = message.attempt,
                    error = %error,
                    store_error = %store_err,
                    "Task failed and its dead letter could not be recorded"
                );
                TaskError::Fatal {
                    error,
                    dead_letter_id: None,
                }
            }
        }
    }
}

impl fmt::Debug for FailureClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureClassifier")
            .field("policy", &self.policy)
            .field("hook", &self.hook)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use crate::retry::RecordingRetryScheduler;
    use crate::store::MemoryStore;
    use crate::tasks::{TaskMessage, PROCESS_FILING};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct RecordingHook {
        seen: Mutex<Vec<uuid::Uuid>>,
    }

    #[async_trait]
    impl PostPersistHook for RecordingHook {
        async fn after_persist(&self, entry: &DeadLetterEntry) {
            self.seen.lock().push(entry.id);
        }
    }

    struct Fixture {
        store: MemoryStore,
        scheduler: Arc<RecordingRetryScheduler>,
        metrics: Arc<InMemoryMetrics>,
        classifier: FailureClassifier,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let scheduler = Arc::new(RecordingRetryScheduler::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let classifier = FailureClassifier::new(
            RetryPolicy::default(),
            scheduler.clone(),
            Arc::new(store.clone()),
            DeadLetterStore::new(metrics.clone()),
            metrics.clone(),
        );
        Fixture {
            store,
            scheduler,
            metrics,
            classifier,
        }
    }

    fn message(attempt: u32) -> TaskMessage {
        let mut payload = Map::new();
        payload.insert("filing_id".into(), json!("R-9"));
        let first = TaskMessage::new(PROCESS_FILING, payload);
        if attempt == 0 {
            first
        } else {
            first.retry(attempt)
        }
    }

    #[tokio::test]
    async fn test_retry_budget_then_dead_letter_once() {
        let fx = fixture();
        let correlation = Correlation::for_receipt("R-9");

        for (attempt, secs) in [(0, 30), (1, 60), (2, 120), (3, 240)] {
            let err = fx
                .classifier
                .handle(&message(attempt), IngestError::transient("timeout"), &correlation)
                .await;
            match err {
                TaskError::RetryScheduled { attempt: next, delay, .. } => {
                    assert_eq!(next, attempt + 1);
                    assert_eq!(delay, Duration::from_secs(secs));
                }
                other => panic!("expected retry, got {other:?}"),
            }
        }
        assert_eq!(fx.scheduler.len(), 4);
        assert!(fx.store.dead_letters().is_empty());

        let err = fx
            .classifier
            .handle(&message(4), IngestError::transient("timeout"), &correlation)
            .await;
        match err {
            TaskError::Fatal {
                error,
                dead_letter_id,
            } => {
                assert_eq!(error, IngestError::fatal("timeout"));
                assert!(dead_letter_id.is_some());
            }
            other => panic!("expected fatal, got {other:?}"),
        }
        assert_eq!(fx.scheduler.len(), 4);
        let letters = fx.store.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].retries, 4);
        assert_eq!(letters[0].receipt_no.as_deref(), Some("R-9"));
        assert_eq!(fx.metrics.retry_count(PROCESS_FILING), 4);
    }

    #[tokio::test]
    async fn test_fatal_is_never_retried() {
        let fx = fixture();
        let hook = Arc::new(RecordingHook::default());
        let classifier = fx.classifier.clone().with_hook(hook.clone());

        let err = classifier
            .handle(&message(0), IngestError::fatal("bad filing"), &Correlation::default())
            .await;

        assert!(err.is_fatal());
        assert!(fx.scheduler.is_empty());
        assert_eq!(fx.store.dead_letters().len(), 1);
        assert_eq!(hook.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_failure_falls_through_to_dead_letter() {
        let fx = fixture();
        fx.scheduler.set_rejecting(true);

        let err = fx
            .classifier
            .handle(&message(1), IngestError::transient("timeout"), &Correlation::default())
            .await;

        assert!(err.is_fatal());
        assert!(fx.scheduler.is_empty());
        let letters = fx.store.dead_letters();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].error.contains("timeout"));
        assert_eq!(fx.metrics.retry_count(PROCESS_FILING), 0);
    }

    #[tokio::test]
    async fn test_retry_and_dead_letter_are_exclusive() {
        for attempt in 0..6 {
            for error in [IngestError::transient("t"), IngestError::fatal("f")] {
                let fx = fixture();
                let result = fx
                    .classifier
                    .handle(&message(attempt), error, &Correlation::default())
                    .await;
                let retried = fx.scheduler.len();
                let dead = fx.store.dead_letters().len();
                assert_eq!(retried + dead, 1, "attempt {attempt}: {result:?}");
                assert_eq!(result.is_retry(), retried == 1);
            }
        }
    }

    #[tokio::test]
    async fn test_unrecordable_dead_letter_still_fatal() {
        let fx = fixture();
        fx.store.set_fail_dead_letter_writes(true);

        let err = fx
            .classifier
            .handle(&message(0), IngestError::fatal("boom"), &Correlation::default())
            .await;

        match err {
            TaskError::Fatal { dead_letter_id, .. } => assert!(dead_letter_id.is_none()),
            other => panic!("expected fatal, got {other:?}"),
        }
    }
}
