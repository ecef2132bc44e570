//! Dead-letter bookkeeping over any [`DeadLetterRepository`].

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::types::{DeadLetterEntry, DeadLetterFilter, DeadLetterStatus, NewDeadLetter};
use crate::config::DeadLetterConfig;
use crate::errors::StoreError;
use crate::metrics::MetricsRecorder;
use crate::store::{DeadLetterRepository, SessionFactory, UnitOfWork};

/// Records, lists, and transitions dead letters.
///
/// Every method works inside the caller's unit of work; only
/// [`record_standalone`](Self::record_standalone) opens and commits its own.
/// Mutations never touch the status gauge. The gauge only reflects
/// committed rows, so whoever commits calls
/// [`refresh_committed`](Self::refresh_committed) afterwards.
#[derive(Debug, Clone)]
pub struct DeadLetterStore {
    metrics: Arc<dyn MetricsRecorder>,
    max_error_chars: usize,
    list_limit: usize,
}

impl DeadLetterStore {
    /// Creates a store with default bounds.
    #[must_use]
    pub fn new(metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self::from_config(&DeadLetterConfig::default(), metrics)
    }

    /// Creates a store with configured bounds.
    #[must_use]
    pub fn from_config(config: &DeadLetterConfig, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            metrics,
            max_error_chars: config.max_error_chars,
            list_limit: config.list_limit,
        }
    }

    /// Returns the listing cap.
    #[must_use]
    pub fn list_limit(&self) -> usize {
        self.list_limit
    }

    /// Inserts a new `pending` entry.
    ///
    /// Not idempotent: each call creates a new row.
    pub async fn record<R>(
        &self,
        repo: &mut R,
        new: NewDeadLetter,
    ) -> Result<DeadLetterEntry, StoreError>
    where
        R: DeadLetterRepository + ?Sized,
    {
        let now = Utc::now();
        let entry = DeadLetterEntry {
            id: Uuid::now_v7(),
            task_name: new.task_name,
            receipt_no: new.correlation.receipt_no,
            corp_code: new.correlation.corp_code,
            ticker: new.correlation.ticker,
            payload: new.payload,
            error: truncate_chars(&new.error, self.max_error_chars),
            retries: u32::try_from(new.retries.max(0)).unwrap_or(u32::MAX),
            status: DeadLetterStatus::Pending,
            next_run_at: None,
            last_error_at: now,
            created_at: now,
            updated_at: now,
        };
        repo.insert_dead_letter(&entry).await?;
        info!(
            dead_letter_id = %entry.id,
            task = %entry.task_name,
            receipt_no = entry.receipt_no.as_deref().unwrap_or(""),
            retries = entry.retries,
            "Recorded dead letter"
        );
        Ok(entry)
    }

    /// Records in a unit of work of its own and commits it.
    pub async fn record_standalone(
        &self,
        sessions: &dyn SessionFactory,
        new: NewDeadLetter,
    ) -> Result<DeadLetterEntry, StoreError> {
        let mut session = sessions.open().await?;
        match self.record(session.as_mut(), new).await {
            Ok(entry) => {
                session.commit().await?;
                self.refresh_committed(sessions).await;
                Ok(entry)
            }
            Err(err) => {
                if let Err(rollback_err) = session.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed dead-letter write failed");
                }
                Err(err)
            }
        }
    }

    /// Lists entries newest first. The limit is capped at the configured
    /// maximum; a zero limit means the maximum.
    pub async fn list<R>(
        &self,
        repo: &mut R,
        filter: DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, StoreError>
    where
        R: DeadLetterRepository + ?Sized,
    {
        let limit = match filter.limit {
            0 => self.list_limit,
            n => n.min(self.list_limit),
        };
        repo.fetch_dead_letters(&DeadLetterFilter { limit, ..filter })
            .await
    }

    /// Fetches one entry.
    pub async fn get<R>(&self, repo: &mut R, id: Uuid) -> Result<Option<DeadLetterEntry>, StoreError>
    where
        R: DeadLetterRepository + ?Sized,
    {
        repo.fetch_dead_letter(id).await
    }

    /// Moves an entry to `requeued`.
    pub async fn mark_requeued<R>(
        &self,
        repo: &mut R,
        entry: &mut DeadLetterEntry,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>
    where
        R: DeadLetterRepository + ?Sized,
    {
        entry.transition(DeadLetterStatus::Requeued, Utc::now());
        entry.next_run_at = next_run_at;
        repo.update_dead_letter(entry).await?;
        Ok(())
    }

    /// Moves an entry to `completed` and clears its schedule.
    pub async fn mark_completed<R>(
        &self,
        repo: &mut R,
        entry: &mut DeadLetterEntry,
    ) -> Result<(), StoreError>
    where
        R: DeadLetterRepository + ?Sized,
    {
        entry.transition(DeadLetterStatus::Completed, Utc::now());
        entry.next_run_at = None;
        repo.update_dead_letter(entry).await?;
        Ok(())
    }

    /// Recomputes per-status counts and publishes every status, zeros included.
    pub async fn refresh_metrics<R>(
        &self,
        repo: &mut R,
    ) -> Result<BTreeMap<DeadLetterStatus, u64>, StoreError>
    where
        R: DeadLetterRepository + ?Sized,
    {
        let mut counts = repo.count_dead_letters().await?;
        for status in DeadLetterStatus::ALL {
            let count = *counts.entry(status).or_insert(0);
            self.metrics.set_dead_letter_depth(status, count);
        }
        Ok(counts)
    }

    /// Republishes the gauge from committed rows, in a read-only unit of
    /// work of its own. Failures are logged, never returned.
    pub async fn refresh_committed(&self, sessions: &dyn SessionFactory) {
        let result = async {
            let mut session = sessions.open().await?;
            let counts = self.refresh_metrics(session.as_mut()).await;
            session.rollback().await?;
            counts
        }
        .await;
        if let Err(err) = result {
            warn!(error = %err, "Failed to refresh dead-letter gauge");
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
