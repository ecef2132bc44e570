//! Operator commands over the dead-letter store.
//!
//! Each command runs in its own unit of work and returns text ready to
//! print. The status gauge is republished after every committed change.
//!
//! A requeued entry carries a `next_run_at`. An operator with a scheduler
//! dispatches it on the spot when it is already due; otherwise it waits for
//! [`DeadLetterOperator::dispatch_due`], which the worker pool runs
//! periodically. Dispatched entries have `next_run_at` cleared so a sweep
//! never sends them twice.

use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dlq::{DeadLetterEntry, DeadLetterFilter, DeadLetterStatus, DeadLetterStore};
use crate::errors::OperatorError;
use crate::retry::RetryScheduler;
use crate::store::{DeadLetterRepository, Session, SessionFactory, UnitOfWork};
use crate::tasks::{is_dispatchable, TaskMessage};

const ERROR_PREVIEW_CHARS: usize = 80;

/// List, show, requeue, complete, and gauge refresh.
#[derive(Clone)]
pub struct DeadLetterOperator {
    sessions: Arc<dyn SessionFactory>,
    store: DeadLetterStore,
    scheduler: Option<Arc<dyn RetryScheduler>>,
}

impl DeadLetterOperator {
    /// Creates an operator that only changes statuses.
    #[must_use]
    pub fn new(sessions: Arc<dyn SessionFactory>, store: DeadLetterStore) -> Self {
        Self {
            sessions,
            store,
            scheduler: None,
        }
    }

    /// Attaches a scheduler so due entries are re-dispatched.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn RetryScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Lists entries as a table, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn list(&self, filter: DeadLetterFilter) -> Result<String, OperatorError> {
        let mut session = self.sessions.open().await?;
        let entries = self.store.list(session.as_mut(), filter).await;
        session.rollback().await?;
        Ok(format_table(&entries?))
    }

    /// Shows one entry as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::NotFound`] for an unknown id.
    pub async fn show(&self, id: Uuid) -> Result<String, OperatorError> {
        let mut session = self.sessions.open().await?;
        let entry = self.store.get(session.as_mut(), id).await;
        session.rollback().await?;
        let entry = entry?.ok_or(OperatorError::NotFound(id))?;
        let json = serde_json::to_string_pretty(&entry)
            .map_err(|err| OperatorError::Store(err.into()))?;
        Ok(json)
    }

    /// Marks an entry requeued to run at `next_run_at`, now if unset.
    ///
    /// With a scheduler attached, an entry that is already due is
    /// dispatched immediately, after the status change is committed. A
    /// rejected message restores the entry as it was. A future entry is left
    /// for [`dispatch_due`](Self::dispatch_due).
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown id, an undispatchable task when a
    /// scheduler is attached, or a rejected message.
    pub async fn requeue(
        &self,
        id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<String, OperatorError> {
        let mut session = self.sessions.open().await?;
        let result = self.requeue_in(session.as_mut(), id, next_run_at).await;
        let (text, dispatch) = finish(session, result).await?;
        self.store.refresh_committed(self.sessions.as_ref()).await;
        if let (Some(original), Some(scheduler)) = (dispatch, &self.scheduler) {
            self.send(scheduler.as_ref(), &original).await?;
            info!(dead_letter_id = %id, task = %original.task_name, "Dead letter dispatched");
        }
        Ok(text)
    }

    /// Returns the text to print and, when the entry must be sent now, its
    /// state before the change.
    async fn requeue_in(
        &self,
        session: &mut dyn Session,
        id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(String, Option<DeadLetterEntry>), OperatorError> {
        let mut entry = self
            .store
            .get(&mut *session, id)
            .await?
            .ok_or(OperatorError::NotFound(id))?;
        let original = entry.clone();
        let now = Utc::now();
        let due_at = next_run_at.unwrap_or(now);

        if self.scheduler.is_none() {
            // Undispatchable tasks are tracked but never picked up by a sweep.
            let schedule = if is_dispatchable(&entry.task_name) {
                Some(due_at)
            } else {
                next_run_at
            };
            self.store
                .mark_requeued(&mut *session, &mut entry, schedule)
                .await?;
            info!(dead_letter_id = %id, task = %entry.task_name, "Dead letter requeued");
            let text = match schedule {
                Some(at) => format!("Requeued {id} ({}), due {}", entry.task_name, stamp(at)),
                None => format!("Requeued {id} ({})", entry.task_name),
            };
            return Ok((text, None));
        }
        if !is_dispatchable(&entry.task_name) {
            return Err(OperatorError::UnknownTask(entry.task_name));
        }

        if due_at > now {
            self.store
                .mark_requeued(&mut *session, &mut entry, Some(due_at))
                .await?;
            info!(
                dead_letter_id = %id,
                task = %entry.task_name,
                due_at = %due_at,
                "Dead letter requeued for later"
            );
            let text = format!("Requeued {id} ({}), due {}", entry.task_name, stamp(due_at));
            return Ok((text, None));
        }

        self.store
            .mark_requeued(&mut *session, &mut entry, None)
            .await?;
        let text = format!("Requeued {id} ({}) and dispatched", entry.task_name);
        Ok((text, Some(original)))
    }

    /// Dispatches every requeued entry whose `next_run_at` has passed.
    ///
    /// Each entry is claimed in a unit of work of its own, by clearing its
    /// `next_run_at`, before its message is sent. Returns how many were
    /// dispatched. A rejected message restores that entry and stops the
    /// sweep.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::NoScheduler`] without a scheduler, or a
    /// store error.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<usize, OperatorError> {
        let scheduler = self.scheduler.as_ref().ok_or(OperatorError::NoScheduler)?;
        let filter = DeadLetterFilter::new(self.store.list_limit())
            .with_status(DeadLetterStatus::Requeued)
            .with_due_by(now);
        let mut session = self.sessions.open().await?;
        let due = self.store.list(session.as_mut(), filter.clone()).await;
        session.rollback().await?;

        let mut dispatched = 0;
        for candidate in due? {
            let mut session = self.sessions.open().await?;
            let result = self.claim_in(session.as_mut(), candidate.id, &filter).await;
            let Some(original) = finish(session, result).await? else {
                continue;
            };
            if !is_dispatchable(&original.task_name) {
                warn!(
                    dead_letter_id = %original.id,
                    task = %original.task_name,
                    "Requeued dead letter has no entry point, unscheduled"
                );
                continue;
            }
            if let Err(err) = self.send(scheduler.as_ref(), &original).await {
                warn!(
                    dead_letter_id = %original.id,
                    error = %err,
                    "Requeue sweep stopped, message rejected"
                );
                break;
            }
            dispatched += 1;
            info!(
                dead_letter_id = %original.id,
                task = %original.task_name,
                "Due dead letter dispatched"
            );
        }
        if dispatched > 0 {
            self.store.refresh_committed(self.sessions.as_ref()).await;
        }
        Ok(dispatched)
    }

    /// Clears the schedule of `id` if it still matches `filter`. Returns the
    /// entry as it was before.
    async fn claim_in(
        &self,
        session: &mut dyn Session,
        id: Uuid,
        filter: &DeadLetterFilter,
    ) -> Result<Option<DeadLetterEntry>, OperatorError> {
        let Some(mut entry) = self.store.get(&mut *session, id).await? else {
            return Ok(None);
        };
        if !filter.matches(&entry) {
            return Ok(None);
        }
        let original = entry.clone();
        self.store
            .mark_requeued(&mut *session, &mut entry, None)
            .await?;
        Ok(Some(original))
    }

    /// Sends `original`'s task. On rejection the entry is written back as
    /// `original` so it is not left claimed but unsent.
    async fn send(
        &self,
        scheduler: &dyn RetryScheduler,
        original: &DeadLetterEntry,
    ) -> Result<(), OperatorError> {
        let Err(err) = scheduler.schedule(redelivery(original), Duration::ZERO).await else {
            return Ok(());
        };
        let restored = async {
            let mut session = self.sessions.open().await?;
            let result = session
                .update_dead_letter(original)
                .await
                .map_err(OperatorError::from);
            finish(session, result).await
        }
        .await;
        match restored {
            Ok(()) => self.store.refresh_committed(self.sessions.as_ref()).await,
            Err(restore_err) => error!(
                dead_letter_id = %original.id,
                error = %restore_err,
                "Could not restore dead letter after rejected dispatch"
            ),
        }
        Err(err.into())
    }

    /// Marks an entry completed.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::NotFound`] for an unknown id.
    pub async fn complete(&self, id: Uuid) -> Result<String, OperatorError> {
        let mut session = self.sessions.open().await?;
        let result = async {
            let mut entry = self
                .store
                .get(session.as_mut(), id)
                .await?
                .ok_or(OperatorError::NotFound(id))?;
            self.store
                .mark_completed(session.as_mut(), &mut entry)
                .await?;
            Ok::<_, OperatorError>(format!("Completed {id} ({})", entry.task_name))
        }
        .await;
        let text = finish(session, result).await?;
        self.store.refresh_committed(self.sessions.as_ref()).await;
        Ok(text)
    }

    /// Republishes the per-status gauge and returns the counts.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn refresh_metrics(&self) -> Result<String, OperatorError> {
        let mut session = self.sessions.open().await?;
        let counts = self.store.refresh_metrics(session.as_mut()).await;
        session.rollback().await?;
        let line = counts?
            .iter()
            .map(|(status, count)| format!("{status}={count}"))
            .collect::<Vec<_>>()
            .join(" ");
        Ok(line)
    }
}

impl std::fmt::Debug for DeadLetterOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterOperator")
            .field("store", &self.store)
            .field("can_dispatch", &self.scheduler.is_some())
            .finish_non_exhaustive()
    }
}

fn stamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn redelivery(entry: &DeadLetterEntry) -> TaskMessage {
    TaskMessage::new(entry.task_name.clone(), entry.payload.clone()).with_dead_letter(entry.id)
}

async fn finish<T>(
    mut session: Box<dyn Session>,
    result: Result<T, OperatorError>,
) -> Result<T, OperatorError> {
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

fn format_table(entries: &[DeadLetterEntry]) -> String {
    if entries.is_empty() {
        return "No dead letters.".to_string();
    }
    let mut out = format!(
        "{:<36}  {:<9}  {:<26}  {:>7}  {:<16}  {:<20}  {}\n",
        "ID", "STATUS", "TASK", "RETRIES", "RECEIPT", "UPDATED", "ERROR"
    );
    for entry in entries {
        let error: String = entry.error.chars().take(ERROR_PREVIEW_CHARS).collect();
        let _ = writeln!(
            out,
            "{:<36}  {:<9}  {:<26}  {:>7}  {:<16}  {:<20}  {}",
            entry.id,
            entry.status,
            entry.task_name,
            entry.retries,
            entry.receipt_no.as_deref().unwrap_or("-"),
            entry.updated_at.format("%Y-%m-%d %H:%M:%S"),
            error.replace('\n', " "),
        );
    }
    out
}
