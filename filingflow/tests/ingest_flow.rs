//! End-to-end flows across the task entry points, the stores, the worker
//! pool, and the operator commands.
//!
//! Run with: cargo test --test ingest_flow

use std::sync::Arc;
use std::time::Duration;

use filingflow::config::PipelineConfig;
use filingflow::core::{FilingStatus, TaskOutcome};
use filingflow::dlq::{DeadLetterFilter, DeadLetterStatus, DeadLetterStore};
use filingflow::metrics::InMemoryMetrics;
use filingflow::operator::DeadLetterOperator;
use filingflow::retry::RecordingRetryScheduler;
use filingflow::store::{
    DeadLetterRepository, FilingRepository, MemoryStore, SqliteSessionFactory, UnitOfWork,
};
use filingflow::tasks::{TaskMessage, Tasks, SYNC_PRICES};
use filingflow::testing::{self, FlakyFeed, Harness, StaticMarket};
use filingflow::worker::{TaskQueue, WorkerPool};

async fn sqlite() -> SqliteSessionFactory {
    let sessions = SqliteSessionFactory::in_memory().await.unwrap();
    sessions.migrate().await.unwrap();
    sessions
}

/// Seed and process against SQLite, then read the persisted status back.
#[tokio::test]
async fn test_seed_then_process_on_sqlite() {
    let sessions = Arc::new(sqlite().await);
    let metrics = Arc::new(InMemoryMetrics::new());
    let tasks = Tasks::new(
        testing::collaborators(),
        sessions.clone(),
        Arc::new(RecordingRetryScheduler::new()),
        metrics.clone(),
        PipelineConfig::default(),
    );

    let seeded = tasks.seed_recent_filings(1).await.unwrap();
    assert_eq!(seeded.count, Some(2));
    let again = tasks.seed_recent_filings(1).await.unwrap();
    assert_eq!(again.count, Some(0));

    let report = tasks.process_filing("S-0").await.unwrap();
    assert_eq!(report.outcome, TaskOutcome::Completed);

    let mut session = sessions.session().await.unwrap();
    let filing = session.load_filing("S-0").await.unwrap().unwrap();
    assert_eq!(filing.status, FilingStatus::Completed);
    assert!(session.load_artifact("S-0", "tables").await.unwrap().is_some());
    let untouched = session.load_filing("S-1").await.unwrap().unwrap();
    assert_eq!(untouched.status, FilingStatus::Pending);
    session.rollback().await.unwrap();

    assert_eq!(metrics.total_results("process_filing"), 1);
}

/// A fatal failure on SQLite is dead-lettered, requeued by an operator,
/// redelivered through the queue, and settled once the task succeeds.
#[tokio::test]
async fn test_dead_letter_requeue_round_trip_on_sqlite() {
    let sessions = Arc::new(sqlite().await);
    let metrics = Arc::new(InMemoryMetrics::new());
    let scheduler = Arc::new(RecordingRetryScheduler::new());

    let mut broken = testing::collaborators();
    broken.market = Arc::new(StaticMarket::fatal("credentials revoked"));
    let failing = Tasks::new(
        broken,
        sessions.clone(),
        scheduler.clone(),
        metrics.clone(),
        PipelineConfig::default(),
    );
    let err = failing.sync_prices(3).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(scheduler.is_empty());

    let (queue, mut receiver) = TaskQueue::new();
    let operator = DeadLetterOperator::new(
        sessions.clone(),
        DeadLetterStore::new(metrics.clone()),
    )
    .with_scheduler(Arc::new(queue));

    let listing = operator
        .list(DeadLetterFilter::new(10).with_status(DeadLetterStatus::Pending))
        .await
        .unwrap();
    assert!(listing.contains(SYNC_PRICES));

    let mut session = sessions.session().await.unwrap();
    let entry = session
        .fetch_dead_letters(&DeadLetterFilter::new(10))
        .await
        .unwrap()
        .remove(0);
    session.rollback().await.unwrap();
    assert_eq!(entry.error, "credentials revoked");

    operator.requeue(entry.id, None).await.unwrap();
    let message = receiver.try_recv().unwrap();
    assert_eq!(message.dead_letter_id, Some(entry.id));

    let healthy = Tasks::new(
        testing::collaborators(),
        sessions.clone(),
        scheduler,
        metrics.clone(),
        PipelineConfig::default(),
    );
    let report = healthy.dispatch(&message).await.unwrap();
    assert_eq!(report.count, Some(30));

    let shown = operator.show(entry.id).await.unwrap();
    assert!(shown.contains("\"status\": \"completed\""));
    assert_eq!(
        operator.refresh_metrics().await.unwrap(),
        "pending=0 requeued=0 completed=1"
    );
}

/// A dead letter requeued without a queue, the way the operator CLI does
/// it, is picked up by a worker pool's requeue sweep and settled.
#[tokio::test]
async fn test_cli_requeue_is_redelivered_by_worker_sweep_on_sqlite() {
    let sessions = Arc::new(sqlite().await);
    let metrics = Arc::new(InMemoryMetrics::new());

    let mut broken = testing::collaborators();
    broken.market = Arc::new(StaticMarket::fatal("credentials revoked"));
    let failing = Tasks::new(
        broken,
        sessions.clone(),
        Arc::new(RecordingRetryScheduler::new()),
        metrics.clone(),
        PipelineConfig::default(),
    );
    failing.sync_prices(3).await.unwrap_err();

    let store = DeadLetterStore::new(metrics.clone());
    let cli = DeadLetterOperator::new(sessions.clone(), store.clone());
    let mut session = sessions.session().await.unwrap();
    let entry = session
        .fetch_dead_letters(&DeadLetterFilter::new(10))
        .await
        .unwrap()
        .remove(0);
    session.rollback().await.unwrap();
    let text = cli.requeue(entry.id, None).await.unwrap();
    assert!(text.contains("due"));

    let (queue, receiver) = TaskQueue::new();
    let queue = queue.with_dead_letters(sessions.clone(), store.clone());
    let healthy = Tasks::new(
        testing::collaborators(),
        sessions.clone(),
        Arc::new(queue.clone()),
        metrics.clone(),
        PipelineConfig::default(),
    );
    let sweeper = DeadLetterOperator::new(sessions.clone(), store).with_scheduler(Arc::new(queue));
    let pool = WorkerPool::new(healthy).with_requeue_sweep(sweeper);
    let shutdown = pool.shutdown_token();
    let handle = tokio::spawn(async move { pool.run(receiver).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let shown = cli.show(entry.id).await.unwrap();
            if shown.contains("\"status\": \"completed\"") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    shutdown.cancel("redelivered");

    let stats = handle.await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(
        cli.refresh_metrics().await.unwrap(),
        "pending=0 requeued=0 completed=1"
    );
}

/// A persistently transient task run through the worker pool is retried
/// until the budget is spent and then dead-lettered exactly once.
#[tokio::test]
async fn test_worker_pool_exhausts_retry_budget() {
    let store = MemoryStore::new();
    let metrics = Arc::new(InMemoryMetrics::new());
    let (queue, receiver) = TaskQueue::new();

    let mut config = PipelineConfig::default();
    config.retry.base_delay_secs = 0;
    config.retry.max_delay_secs = 0;
    let mut collaborators = testing::collaborators();
    collaborators.market = Arc::new(StaticMarket::transient("upstream 503"));

    let tasks = Tasks::new(
        collaborators,
        Arc::new(store.clone()),
        Arc::new(queue.clone()),
        metrics.clone(),
        config,
    );
    let pool = WorkerPool::new(tasks).with_concurrency(1);
    let shutdown = pool.shutdown_token();
    let handle = tokio::spawn(async move { pool.run(receiver).await });

    queue.enqueue(TaskMessage::sync_prices(1)).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while store.dead_letters().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    shutdown.cancel("dead letter observed");

    let stats = handle.await.unwrap();
    assert_eq!(stats.retried, 4);
    assert_eq!(stats.failed, 1);
    assert_eq!(metrics.retry_count(SYNC_PRICES), 4);

    let letters = store.dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].retries, 4);
    assert_eq!(letters[0].status, DeadLetterStatus::Pending);
}

/// Four consecutive connection failures followed by a success use four
/// retries and leave no dead letter.
#[tokio::test]
async fn test_flaky_seed_recovers_on_last_attempt() {
    let mut collaborators = testing::collaborators();
    collaborators.feed = Arc::new(FlakyFeed::new(4, testing::sample_filings(3)));
    let harness = Harness::with_collaborators(collaborators);

    let first = harness.tasks.seed_recent_filings(1).await.unwrap_err();
    assert!(first.is_retry());

    let redeliveries = harness.drain_retries().await;
    assert_eq!(redeliveries.len(), 4);
    assert!(redeliveries[..3].iter().all(|r| r.as_ref().is_err_and(|e| e.is_retry())));
    let report = redeliveries[3].as_ref().unwrap();
    assert_eq!(report.count, Some(3));

    assert!(harness.store.dead_letters().is_empty());
    assert_eq!(harness.metrics.retry_count("ingest.seed_recent_filings"), 4);
}
