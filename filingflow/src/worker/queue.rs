//! In-process task queue with delayed delivery.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::undelivered::{log_lost, Undelivered};
use crate::dlq::DeadLetterStore;
use crate::errors::SchedulerError;
use crate::retry::RetryScheduler;
use crate::store::SessionFactory;
use crate::tasks::TaskMessage;

/// Dead-letter reason for a delayed message whose receiver went away.
pub const CLOSED_BEFORE_DELIVERY: &str = "task queue closed before delayed delivery";

/// Sending half of the queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<TaskMessage>,
    undelivered: Option<Undelivered>,
}

/// Receiving half of the queue, consumed by a worker pool.
#[derive(Debug)]
pub struct TaskReceiver {
    receiver: mpsc::UnboundedReceiver<TaskMessage>,
}

impl TaskQueue {
    /// Creates a connected queue pair.
    #[must_use]
    pub fn new() -> (Self, TaskReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                undelivered: None,
            },
            TaskReceiver { receiver },
        )
    }

    /// Dead-letters delayed messages that come due after the receiver is
    /// gone. Without this they are only logged.
    #[must_use]
    pub fn with_dead_letters(
        mut self,
        sessions: Arc<dyn SessionFactory>,
        store: DeadLetterStore,
    ) -> Self {
        self.undelivered = Some(Undelivered::new(sessions, store));
        self
    }

    /// Enqueues `message` for immediate delivery.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] once the receiver is gone.
    pub fn enqueue(&self, message: TaskMessage) -> Result<(), SchedulerError> {
        self.sender
            .send(message)
            .map_err(|_| SchedulerError::Closed)
    }

    /// Enqueues `message` after `delay`.
    ///
    /// Delayed messages are held by a timer task. A message whose timer
    /// fires after the receiver is gone is dead-lettered with its attempt
    /// as the retry count, see [`TaskQueue::with_dead_letters`].
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] if the receiver is already gone.
    pub fn enqueue_after(&self, message: TaskMessage, delay: Duration) -> Result<(), SchedulerError> {
        if self.sender.is_closed() {
            return Err(SchedulerError::Closed);
        }
        if delay.is_zero() {
            return self.enqueue(message);
        }
        let sender = self.sender.clone();
        let undelivered = self.undelivered.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(mpsc::error::SendError(message)) = sender.send(message) {
                match undelivered {
                    Some(undelivered) => {
                        undelivered.record(&message, CLOSED_BEFORE_DELIVERY).await;
                    }
                    None => log_lost(&message, CLOSED_BEFORE_DELIVERY, &SchedulerError::Closed),
                }
            }
        });
        Ok(())
    }

    /// Returns whether the receiver has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl TaskReceiver {
    /// Waits for the next message. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<TaskMessage> {
        self.receiver.recv().await
    }

    /// Returns a message if one is ready.
    pub fn try_recv(&mut self) -> Option<TaskMessage> {
        self.receiver.try_recv().ok()
    }

    /// Stops accepting messages. Already buffered ones can still be
    /// received with [`TaskReceiver::try_recv`].
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

#[async_trait]
impl RetryScheduler for TaskQueue {
    async fn schedule(&self, message: TaskMessage, delay: Duration) -> Result<(), SchedulerError> {
        self.enqueue_after(message, delay)
    }
}
