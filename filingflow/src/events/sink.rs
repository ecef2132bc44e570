//! Audit event sinks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use tracing::{debug, info, Level};

/// One audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Dotted event type, e.g. `dead_letter.recorded`.
    pub event_type: String,
    /// Event body.
    pub data: Value,
    /// When the event was raised.
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    /// Creates an event stamped now.
    #[must_use]
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            at: Utc::now(),
        }
    }
}

/// Receives audit events.
#[async_trait]
pub trait EventSink: Send + Sync + Debug {
    /// Emits an event.
    async fn emit(&self, event: AuditEvent);

    /// Emits without waiting. Never fails; problems are logged.
    fn try_emit(&self, event: AuditEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: AuditEvent) {}

    fn try_emit(&self, _event: AuditEvent) {}
}

/// Writes events to the log.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Logs at `level`. Anything other than DEBUG logs at INFO.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    fn log_event(&self, event: &AuditEvent) {
        if self.level == Level::DEBUG {
            debug!(event_type = %event.event_type, data = %event.data, "Audit event");
        } else {
            info!(event_type = %event.event_type, data = %event.data, "Audit event");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: AuditEvent) {
        self.log_event(&event);
    }

    fn try_emit(&self, event: AuditEvent) {
        self.log_event(&event);
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<AuditEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.read().clone()
    }

    /// Returns events whose type starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<AuditEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// True if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: AuditEvent) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: AuditEvent) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_collecting_sink_filters_by_prefix() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(AuditEvent::new("dead_letter.recorded", json!({"id": 1})))
            .await;
        sink.try_emit(AuditEvent::new("dead_letter.requeued", json!({})));
        sink.try_emit(AuditEvent::new("worker.stopped", json!({})));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type("dead_letter.").len(), 2);
    }

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink
            .emit(AuditEvent::new("x", Value::Null))
            .await;
        LoggingEventSink::new(Level::DEBUG).try_emit(AuditEvent::new("x", json!([1])));
    }
}
