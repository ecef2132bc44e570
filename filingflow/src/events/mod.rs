//! Audit events.
//!
//! Dead-letter bookkeeping can be mirrored to an [`EventSink`] through
//! [`EventSinkHook`], installed as the classifier's post-persist hook.

mod sink;

pub use sink::{AuditEvent, CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::dlq::DeadLetterEntry;
use crate::retry::PostPersistHook;

/// Event raised after a dead letter is recorded.
pub const DEAD_LETTER_RECORDED: &str = "dead_letter.recorded";

/// Post-persist hook that emits [`DEAD_LETTER_RECORDED`].
#[derive(Debug, Clone)]
pub struct EventSinkHook {
    sink: Arc<dyn EventSink>,
}

impl EventSinkHook {
    /// Emits into `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl PostPersistHook for EventSinkHook {
    async fn after_persist(&self, entry: &DeadLetterEntry) {
        let data = json!({
            "id": entry.id,
            "task_name": entry.task_name,
            "retries": entry.retries,
            "receipt_no": entry.receipt_no,
            "corp_code": entry.corp_code,
            "ticker": entry.ticker,
            "error": entry.error,
        });
        self.sink
            .emit(AuditEvent::new(DEAD_LETTER_RECORDED, data))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, StaticMarket};

    #[tokio::test]
    async fn test_hook_emits_on_dead_letter() {
        let sink = Arc::new(CollectingEventSink::new());
        let mut collaborators = crate::testing::collaborators();
        collaborators.market = Arc::new(StaticMarket::fatal("gone"));
        let mut harness = Harness::with_collaborators(collaborators);
        harness.tasks = harness
            .tasks
            .clone()
            .with_hook(Arc::new(EventSinkHook::new(sink.clone())));

        let _ = harness.tasks.sync_metadata().await;

        let events = sink.events_of_type(DEAD_LETTER_RECORDED);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["task_name"], "market.sync_metadata");
        assert_eq!(events[0].data["error"], "gone");
    }
}
