//! Benchmarks for pipeline execution.

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

use filingflow::core::StageOutcome;
use filingflow::pipeline::{rollup, summary_line};
use filingflow::retry::RetryPolicy;
use filingflow::stages::StageResult;
use filingflow::tasks::TaskMessage;
use filingflow::testing::Harness;

fn sample_results() -> Vec<StageResult> {
    let now = Utc::now();
    vec![
        StageResult::new("ingest_chunks", true, StageOutcome::Success, now),
        StageResult::new("extract_tables", false, StageOutcome::fail("timeout"), now),
        StageResult::new("classify_category", false, StageOutcome::Success, now),
        StageResult::new("extract_facts", false, StageOutcome::Success, now),
        StageResult::new("summarize_and_notify", false, StageOutcome::Success, now),
    ]
}

fn rollup_benchmark(c: &mut Criterion) {
    let results = sample_results();
    c.bench_function("rollup_five_stages", |b| {
        b.iter(|| rollup(black_box(&results)));
    });
    c.bench_function("summary_line_five_stages", |b| {
        b.iter(|| summary_line(black_box(&results)));
    });
}

fn retry_policy_benchmark(c: &mut Criterion) {
    let policy = RetryPolicy::new(4, Duration::from_secs(30), Duration::from_secs(600));
    c.bench_function("delay_for_attempt", |b| {
        b.iter(|| {
            for attempt in 0..8 {
                black_box(policy.delay_for_attempt(black_box(attempt)));
            }
        });
    });
}

fn process_filing_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let harness = Harness::new();
    harness.insert_sample_filing("B-1");
    let message = TaskMessage::process_filing("B-1");

    c.bench_function("process_filing_in_memory", |b| {
        b.iter(|| runtime.block_on(harness.tasks.dispatch(black_box(&message))));
    });
}

criterion_group!(
    benches,
    rollup_benchmark,
    retry_policy_benchmark,
    process_filing_benchmark
);
criterion_main!(benches);
