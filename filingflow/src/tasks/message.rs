//! The queue-dispatch unit.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::dlq::{payload_of, Payload};
use crate::errors::TaskError;

/// Processes one filing through the stage pipeline.
pub const PROCESS_FILING: &str = "ingest.process_filing";
/// Pulls recent filings from the feed.
pub const SEED_RECENT_FILINGS: &str = "ingest.seed_recent_filings";
/// Syncs market prices.
pub const SYNC_PRICES: &str = "market.sync_prices";
/// Syncs listing metadata.
pub const SYNC_METADATA: &str = "market.sync_metadata";
/// Reruns table extraction for one filing.
pub const EXTRACT_TABLES_TASK: &str = "tables.extract";

/// Default look-back window for feed and price tasks.
pub const DEFAULT_DAYS_BACK: u32 = 1;

/// A named task invocation with JSON arguments.
///
/// Retries redeliver the same message with a higher `attempt`, so a retry
/// always re-targets the same logical unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Task name, e.g. `ingest.process_filing`.
    pub task_name: String,
    /// Primitive arguments.
    pub payload: Payload,
    /// Zero-based attempt number.
    #[serde(default)]
    pub attempt: u32,
    /// Dead letter this message was requeued from.
    #[serde(default)]
    pub dead_letter_id: Option<Uuid>,
}

impl TaskMessage {
    /// Creates a first-attempt message.
    #[must_use]
    pub fn new(task_name: impl Into<String>, payload: Payload) -> Self {
        Self {
            task_name: task_name.into(),
            payload,
            attempt: 0,
            dead_letter_id: None,
        }
    }

    /// `ingest.process_filing` for `filing_id`.
    #[must_use]
    pub fn process_filing(filing_id: &str) -> Self {
        Self::new(PROCESS_FILING, payload_of([("filing_id", json!(filing_id))]))
    }

    /// `ingest.seed_recent_filings` over `days_back` days.
    #[must_use]
    pub fn seed_recent_filings(days_back: u32) -> Self {
        Self::new(SEED_RECENT_FILINGS, payload_of([("days_back", json!(days_back))]))
    }

    /// `market.sync_prices` over `days_back` days.
    #[must_use]
    pub fn sync_prices(days_back: u32) -> Self {
        Self::new(SYNC_PRICES, payload_of([("days_back", json!(days_back))]))
    }

    /// `market.sync_metadata`.
    #[must_use]
    pub fn sync_metadata() -> Self {
        Self::new(SYNC_METADATA, Payload::new())
    }

    /// `tables.extract` for `filing_id`.
    #[must_use]
    pub fn extract_tables(filing_id: &str) -> Self {
        Self::new(EXTRACT_TABLES_TASK, payload_of([("filing_id", json!(filing_id))]))
    }

    /// The same message as attempt `next_attempt`.
    #[must_use]
    pub fn retry(&self, next_attempt: u32) -> Self {
        Self {
            attempt: next_attempt,
            ..self.clone()
        }
    }

    /// Links the message to the dead letter it was requeued from.
    #[must_use]
    pub fn with_dead_letter(mut self, id: Uuid) -> Self {
        self.dead_letter_id = Some(id);
        self
    }

    /// Reads a required string argument.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidPayload`] if the key is missing or blank.
    pub fn str_arg(&self, key: &str) -> Result<String, TaskError> {
        match self.payload.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(other) => Err(self.invalid(format!("'{key}' must be a string, got {other}"))),
            None => Err(self.invalid(format!("missing '{key}'"))),
        }
    }

    /// Reads an optional non-negative integer argument.
    ///
    /// Numeric strings are accepted, since dead-letter payloads may have
    /// stringified them.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidPayload`] if the value is not a `u32`.
    pub fn u32_arg(&self, key: &str, default: u32) -> Result<u32, TaskError> {
        let parsed = match self.payload.get(key) {
            None | Some(Value::Null) => return Ok(default),
            Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            Some(Value::String(s)) => s.trim().parse().ok(),
            Some(_) => None,
        };
        parsed.ok_or_else(|| self.invalid(format!("'{key}' must be a non-negative integer")))
    }

    fn invalid(&self, reason: String) -> TaskError {
        TaskError::InvalidPayload {
            task: self.task_name.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_keeps_payload_and_dead_letter() {
        let id = Uuid::now_v7();
        let message = TaskMessage::process_filing("R-1").with_dead_letter(id);
        let retried = message.retry(3);
        assert_eq!(retried.attempt, 3);
        assert_eq!(retried.payload, message.payload);
        assert_eq!(retried.dead_letter_id, Some(id));
    }

    #[test]
    fn test_args() {
        let message = TaskMessage::new(
            SYNC_PRICES,
            payload_of([("days_back", json!("7")), ("filing_id", json!(""))]),
        );
        assert_eq!(message.u32_arg("days_back", 1).unwrap(), 7);
        assert_eq!(message.u32_arg("missing", 1).unwrap(), 1);
        assert!(message.str_arg("filing_id").is_err());
        assert!(matches!(
            message.str_arg("nope"),
            Err(TaskError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_negative_days_rejected() {
        let message = TaskMessage::new(SYNC_PRICES, payload_of([("days_back", json!(-2))]));
        assert!(message.u32_arg("days_back", 1).is_err());
    }

    #[test]
    fn test_serde_defaults() {
        let message: TaskMessage = serde_json::from_str(
            r#"{"task_name":"market.sync_metadata","payload":{}}"#,
        )
        .unwrap();
        assert_eq!(message.attempt, 0);
        assert!(message.dead_letter_id.is_none());
    }
}
