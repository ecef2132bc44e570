//! Dead-lettering of messages the queue accepted but never delivered.

use chrono::Utc;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::core::Correlation;
use crate::dlq::{DeadLetterStore, NewDeadLetter};
use crate::errors::StoreError;
use crate::store::{SessionFactory, UnitOfWork};
use crate::tasks::TaskMessage;

/// Persists undelivered messages so they are never dropped silently.
///
/// A fresh message becomes a new `pending` dead letter whose retry count is
/// the attempt it would have run as. A redelivery of an existing dead letter
/// is re-armed instead, so the next requeue sweep sends it again.
#[derive(Clone)]
pub(crate) struct Undelivered {
    sessions: Arc<dyn SessionFactory>,
    store: DeadLetterStore,
}

impl Undelivered {
    pub(crate) fn new(sessions: Arc<dyn SessionFactory>, store: DeadLetterStore) -> Self {
        Self { sessions, store }
    }

    pub(crate) async fn record(&self, message: &TaskMessage, reason: &str) {
        let result = match message.dead_letter_id {
            Some(id) => self.rearm(id).await.map(|()| id),
            None => self
                .store
                .record_standalone(self.sessions.as_ref(), dead_letter_for(message, reason))
                .await
                .map(|entry| entry.id),
        };
        match result {
            Ok(id) => warn!(
                task = %message.task_name,
                attempt = message.attempt,
                dead_letter_id = %id,
                reason,
                "Undelivered message dead-lettered"
            ),
            Err(err) => log_lost(message, reason, &err),
        }
    }

    async fn rearm(&self, id: Uuid) -> Result<(), StoreError> {
        let mut session = self.sessions.open().await?;
        let result = async {
            let mut entry = self
                .store
                .get(session.as_mut(), id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("dead letter {id}")))?;
            self.store
                .mark_requeued(session.as_mut(), &mut entry, Some(Utc::now()))
                .await
        }
        .await;
        match result {
            Ok(()) => {
                session.commit().await?;
                self.store.refresh_committed(self.sessions.as_ref()).await;
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = session.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(err)
            }
        }
    }
}

impl fmt::Debug for Undelivered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Undelivered")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

fn dead_letter_for(message: &TaskMessage, reason: &str) -> NewDeadLetter {
    let mut new = NewDeadLetter::new(message.task_name.clone(), message.payload.clone(), reason)
        .with_retries(i64::from(message.attempt));
    if let Some(Value::String(filing_id)) = message.payload.get("filing_id") {
        new = new.with_correlation(Correlation::for_receipt(filing_id.clone()));
    }
    new
}

/// Last resort when nothing could be persisted: the payload goes to the log.
pub(crate) fn log_lost(message: &TaskMessage, reason: &str, err: &dyn fmt::Display) {
    error!(
        task = %message.task_name,
        attempt = message.attempt,
        payload = %serde_json::Value::Object(message.payload.clone()),
        reason,
        error = %err,
        "Undelivered message lost"
    );
}
