//! Bounded-concurrency consumer of the task queue.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::undelivered::Undelivered;
use super::{ShutdownToken, TaskReceiver};
use crate::errors::TaskError;
use crate::operator::DeadLetterOperator;
use crate::tasks::{TaskReport, Tasks};

/// Dead-letter reason for a message still queued when the pool stopped.
pub const STOPPED_BEFORE_DELIVERY: &str = "worker pool stopped before delivery";

/// Counts of finished deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Deliveries that returned a report.
    pub completed: u64,
    /// Deliveries that scheduled a retry.
    pub retried: u64,
    /// Deliveries that ended fatally, including crashed workers.
    pub failed: u64,
    /// Undeliverable messages.
    pub rejected: u64,
    /// Messages still queued at shutdown, dead-lettered unrun.
    pub abandoned: u64,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    abandoned: AtomicU64,
}

impl Counters {
    fn record(&self, result: &Result<TaskReport, TaskError>) {
        let counter = match result {
            Ok(_) => &self.completed,
            Err(TaskError::RetryScheduled { .. }) => &self.retried,
            Err(TaskError::Fatal { .. }) => &self.failed,
            Err(TaskError::UnknownTask(_) | TaskError::InvalidPayload { .. }) => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn reap(&self, joined: Result<(), JoinError>) {
        if let Err(err) = joined {
            error!(error = %err, "Worker task crashed");
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
struct RequeueSweep {
    operator: DeadLetterOperator,
    every: Duration,
}

impl RequeueSweep {
    async fn run(self, shutdown: ShutdownToken) {
        let mut ticker = tokio::time::interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.operator.dispatch_due(Utc::now()).await {
                Ok(0) => {}
                Ok(dispatched) => info!(dispatched, "Requeue sweep dispatched dead letters"),
                Err(err) => warn!(error = %err, "Requeue sweep failed"),
            }
        }
    }
}

/// Runs queued tasks with at most `concurrency` in flight.
///
/// Each message is processed to completion by one worker; parallelism is
/// across messages only. Messages still queued when the pool stops are
/// dead-lettered, never dropped.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    tasks: Arc<Tasks>,
    concurrency: usize,
    shutdown: ShutdownToken,
    undelivered: Undelivered,
    sweep: Option<RequeueSweep>,
}

impl WorkerPool {
    /// Creates a pool sized by `tasks.config().worker.concurrency`.
    #[must_use]
    pub fn new(tasks: Tasks) -> Self {
        let concurrency = tasks.config().worker.concurrency;
        let undelivered =
            Undelivered::new(Arc::clone(tasks.sessions()), tasks.dead_letters().clone());
        Self {
            tasks: Arc::new(tasks),
            concurrency: concurrency.max(1),
            shutdown: ShutdownToken::new(),
            undelivered,
            sweep: None,
        }
    }

    /// Overrides the concurrency limit. Zero is treated as one.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Runs [`DeadLetterOperator::dispatch_due`] every
    /// `worker.requeue_sweep_secs` while the pool runs.
    ///
    /// The operator needs a scheduler feeding this pool's queue. That
    /// sender keeps the queue open, so such a pool only stops through its
    /// shutdown token.
    #[must_use]
    pub fn with_requeue_sweep(mut self, operator: DeadLetterOperator) -> Self {
        let secs = self.tasks.config().worker.requeue_sweep_secs.max(1);
        self.sweep = Some(RequeueSweep {
            operator,
            every: Duration::from_secs(secs),
        });
        self
    }

    /// Returns the shutdown token; cancelling it stops [`WorkerPool::run`].
    #[must_use]
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Consumes `receiver` until shutdown or until every sender is gone,
    /// then dead-letters whatever is still queued and waits for in-flight
    /// tasks.
    pub async fn run(&self, mut receiver: TaskReceiver) -> WorkerStats {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let counters = Arc::new(Counters::default());
        let mut in_flight = JoinSet::new();
        let sweep = self
            .sweep
            .clone()
            .map(|sweep| tokio::spawn(sweep.run(self.shutdown.clone())));
        info!(
            concurrency = self.concurrency,
            requeue_sweep = sweep.is_some(),
            "Worker pool started"
        );

        loop {
            let permit = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let message = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let tasks = Arc::clone(&self.tasks);
            let task_counters = Arc::clone(&counters);
            in_flight.spawn(async move {
                let _permit = permit;
                let result = tasks.dispatch(&message).await;
                if let Err(err @ (TaskError::UnknownTask(_) | TaskError::InvalidPayload { .. })) =
                    &result
                {
                    error!(task = %message.task_name, error = %err, "Message rejected");
                }
                task_counters.record(&result);
            });
            while let Some(joined) = in_flight.try_join_next() {
                counters.reap(joined);
            }
        }

        if let Some(sweep) = sweep {
            if !self.shutdown.is_cancelled() {
                sweep.abort();
            }
            if let Err(err) = sweep.await {
                if !err.is_cancelled() {
                    error!(error = %err, "Requeue sweep crashed");
                }
            }
        }
        receiver.close();
        while let Some(message) = receiver.try_recv() {
            self.undelivered
                .record(&message, STOPPED_BEFORE_DELIVERY)
                .await;
            counters.abandoned.fetch_add(1, Ordering::Relaxed);
        }
        while let Some(joined) = in_flight.join_next().await {
            counters.reap(joined);
        }

        let stats = counters.snapshot();
        info!(
            completed = stats.completed,
            retried = stats.retried,
            failed = stats.failed,
            rejected = stats.rejected,
            abandoned = stats.abandoned,
            reason = self.shutdown.reason().unwrap_or_default(),
            "Worker pool stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::dlq::{payload_of, DeadLetterStatus, DeadLetterStore, NewDeadLetter};
    use crate::metrics::InMemoryMetrics;
    use crate::retry::RecordingRetryScheduler;
    use crate::store::MemoryStore;
    use crate::tasks::{TaskMessage, SYNC_PRICES};
    use crate::testing::{self, Harness, PanickingMarket, StaticMarket};
    use crate::worker::TaskQueue;
    use serde_json::json;

    async fn wait_until(mut ready: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !ready() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_pool_drains_queue_until_senders_drop() {
        let harness = Harness::new();
        harness.insert_sample_filing("R-1");
        harness.insert_sample_filing("R-2");
        let (queue, receiver) = TaskQueue::new();
        queue.enqueue(TaskMessage::process_filing("R-1")).unwrap();
        queue.enqueue(TaskMessage::process_filing("R-2")).unwrap();
        queue.enqueue(TaskMessage::new("nope", crate::dlq::Payload::new())).unwrap();
        drop(queue);

        let stats = WorkerPool::new(harness.tasks.clone())
            .with_concurrency(2)
            .run(receiver)
            .await;

        assert_eq!(stats.completed, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(
            harness.store.filing("R-2").unwrap().status,
            crate::core::FilingStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_pool_counts_failures() {
        let mut collaborators = testing::collaborators();
        collaborators.market = Arc::new(StaticMarket::fatal("revoked"));
        let harness = Harness::with_collaborators(collaborators);
        let (queue, receiver) = TaskQueue::new();
        queue.enqueue(TaskMessage::sync_prices(1)).unwrap();
        drop(queue);

        let stats = WorkerPool::new(harness.tasks.clone()).run(receiver).await;

        assert_eq!(stats.failed, 1);
        assert_eq!(harness.store.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_pool() {
        let harness = Harness::new();
        let (_queue, receiver) = TaskQueue::new();
        let pool = WorkerPool::new(harness.tasks.clone());
        let token = pool.shutdown_token();

        let handle = tokio::spawn(async move { pool.run(receiver).await });
        token.cancel("test over");

        let stats = handle.await.unwrap();
        assert_eq!(stats, WorkerStats::default());
    }

    #[tokio::test]
    async fn test_panicking_task_is_retried_then_dead_lettered() {
        let store = MemoryStore::new();
        let (queue, receiver) = TaskQueue::new();
        let mut config = PipelineConfig::default();
        config.retry.base_delay_secs = 0;
        config.retry.max_delay_secs = 0;
        let mut collaborators = testing::collaborators();
        collaborators.market = Arc::new(PanickingMarket::new("feed parser crashed"));
        let tasks = Tasks::new(
            collaborators,
            Arc::new(store.clone()),
            Arc::new(queue.clone()),
            Arc::new(InMemoryMetrics::new()),
            config,
        );
        let pool = WorkerPool::new(tasks).with_concurrency(1);
        let shutdown = pool.shutdown_token();
        let handle = tokio::spawn(async move { pool.run(receiver).await });

        queue.enqueue(TaskMessage::sync_prices(1)).unwrap();
        wait_until(|| !store.dead_letters().is_empty()).await;
        shutdown.cancel("dead letter observed");

        let stats = handle.await.unwrap();
        assert_eq!(stats.retried, 4);
        assert_eq!(stats.failed, 1);
        let letters = store.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].error, "task panicked: feed parser crashed");
    }

    #[tokio::test]
    async fn test_shutdown_dead_letters_queued_messages() {
        let harness = Harness::new();
        let existing = harness
            .tasks
            .dead_letters()
            .record_standalone(
                &harness.store,
                NewDeadLetter::new(SYNC_PRICES, payload_of([("days_back", json!(3))]), "boom"),
            )
            .await
            .unwrap();

        let (queue, receiver) = TaskQueue::new();
        queue.enqueue(TaskMessage::process_filing("R-1").retry(2)).unwrap();
        queue.enqueue(TaskMessage::sync_metadata()).unwrap();
        queue
            .enqueue(TaskMessage::sync_prices(3).with_dead_letter(existing.id))
            .unwrap();
        let pool = WorkerPool::new(harness.tasks.clone());
        pool.shutdown_token().cancel("deploy");

        let stats = pool.run(receiver).await;

        assert_eq!(stats.abandoned, 3);
        assert_eq!(stats.completed, 0);
        assert!(queue.is_closed());
        let letters = harness.store.dead_letters();
        assert_eq!(letters.len(), 3);
        let process = letters
            .iter()
            .find(|e| e.task_name == crate::tasks::PROCESS_FILING)
            .unwrap();
        assert_eq!(process.retries, 2);
        assert_eq!(process.error, STOPPED_BEFORE_DELIVERY);
        assert_eq!(process.receipt_no.as_deref(), Some("R-1"));

        let rearmed = letters.iter().find(|e| e.id == existing.id).unwrap();
        assert_eq!(rearmed.status, DeadLetterStatus::Requeued);
        assert!(rearmed.next_run_at.is_some());
    }

    #[tokio::test]
    async fn test_requeue_sweep_redelivers_requeued_entry() {
        let store = MemoryStore::new();
        let metrics = Arc::new(InMemoryMetrics::new());
        let dead_letters = DeadLetterStore::new(metrics.clone());
        let entry = dead_letters
            .record_standalone(
                &store,
                NewDeadLetter::new(SYNC_PRICES, payload_of([("days_back", json!(2))]), "boom"),
            )
            .await
            .unwrap();
        let operator = DeadLetterOperator::new(Arc::new(store.clone()), dead_letters);
        operator.requeue(entry.id, None).await.unwrap();

        let (queue, receiver) = TaskQueue::new();
        let tasks = Tasks::new(
            testing::collaborators(),
            Arc::new(store.clone()),
            Arc::new(RecordingRetryScheduler::new()),
            metrics.clone(),
            PipelineConfig::default(),
        );
        let pool = WorkerPool::new(tasks)
            .with_requeue_sweep(operator.with_scheduler(Arc::new(queue)));
        let shutdown = pool.shutdown_token();
        let handle = tokio::spawn(async move { pool.run(receiver).await });

        wait_until(|| store.dead_letters()[0].status == DeadLetterStatus::Completed).await;
        shutdown.cancel("redelivered");

        let stats = handle.await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.abandoned, 0);
        assert_eq!(store.dead_letters()[0].next_run_at, None);
        assert_eq!(metrics.dead_letter_depth(DeadLetterStatus::Completed), Some(1));
    }
}
