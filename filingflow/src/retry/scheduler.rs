//! Delayed redelivery of task messages.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::errors::SchedulerError;
use crate::tasks::TaskMessage;

/// Hands a task message back to the queue after a delay.
///
/// The failure classifier depends only on this trait, never on a specific
/// queue backend.
#[async_trait]
pub trait RetryScheduler: Send + Sync {
    /// Schedules `message` for delivery after `delay`.
    async fn schedule(&self, message: TaskMessage, delay: Duration) -> Result<(), SchedulerError>;
}

/// A retry captured by [`RecordingRetryScheduler`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledRetry {
    /// The message that would be redelivered.
    pub message: TaskMessage,
    /// Requested delay.
    pub delay: Duration,
}

/// Scheduler that records requests instead of delivering them.
#[derive(Debug, Default)]
pub struct RecordingRetryScheduler {
    scheduled: Mutex<Vec<ScheduledRetry>>,
    reject: AtomicBool,
}

impl RecordingRetryScheduler {
    /// Creates an accepting scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scheduler that rejects every request.
    #[must_use]
    pub fn rejecting() -> Self {
        let scheduler = Self::default();
        scheduler.set_rejecting(true);
        scheduler
    }

    /// Switches rejection on or off.
    pub fn set_rejecting(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Returns all recorded retries.
    #[must_use]
    pub fn scheduled(&self) -> Vec<ScheduledRetry> {
        self.scheduled.lock().clone()
    }

    /// Number of recorded retries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scheduled.lock().len()
    }

    /// True if nothing was scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scheduled.lock().is_empty()
    }

    /// Removes and returns the oldest recorded retry.
    pub fn pop_front(&self) -> Option<ScheduledRetry> {
        let mut scheduled = self.scheduled.lock();
        if scheduled.is_empty() {
            None
        } else {
            Some(scheduled.remove(0))
        }
    }
}

#[async_trait]
impl RetryScheduler for RecordingRetryScheduler {
    async fn schedule(&self, message: TaskMessage, delay: Duration) -> Result<(), SchedulerError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(SchedulerError::Rejected("recording scheduler set to reject".into()));
        }
        self.scheduled.lock().push(ScheduledRetry { message, delay });
        Ok(())
    }
}
