//! Integration tests for the intake consumer and aggregation runners.

mod common;

use std::time::Duration;

use common::fixtures::{FailingStore, ReportBuilder};
use common::TestHarness;
use faultline_aggregator::store::ErrorStore;
use faultline_aggregator::{
    AggregatorConfig, IngestOutcome, IntakeDisposition, RunDisposition,
};
use faultline_state::QueueBackend;
use tokio_util::sync::CancellationToken;

fn fast_config() -> AggregatorConfig {
    let mut config = AggregatorConfig::default();
    config.intake.poll_interval_ms = 10;
    config.runner.poll_interval_ms = 10;
    config.runner.sweep_interval_secs = 1;
    config
}

#[tokio::test]
async fn intake_ingests_submitted_report() {
    let harness = TestHarness::new();
    let intake = harness.intake();

    intake
        .submit(&ReportBuilder::new("shop").to_json())
        .await
        .unwrap();
    let disposition = intake.process_next().await.unwrap();

    assert!(matches!(
        disposition,
        Some(IntakeDisposition::Ingested(IngestOutcome::Created(_)))
    ));
    assert_eq!(harness.queue.inner.len(&harness.config.queues.reports).await, 0);
}

#[tokio::test]
async fn intake_drops_malformed_and_invalid_reports() {
    let harness = TestHarness::new();
    let intake = harness.intake();

    intake.submit(b"{\"project\":").await.unwrap();
    intake
        .submit(&ReportBuilder::new("").to_json())
        .await
        .unwrap();

    assert_eq!(
        intake.process_next().await.unwrap(),
        Some(IntakeDisposition::Dropped)
    );
    assert_eq!(
        intake.process_next().await.unwrap(),
        Some(IntakeDisposition::Dropped)
    );
    assert_eq!(harness.queue.inner.len(&harness.config.queues.reports).await, 0);
}

#[tokio::test]
async fn intake_requeues_on_storage_failure() {
    let harness = TestHarness::new();
    let intake = harness.intake();
    intake
        .submit(&ReportBuilder::new("shop").to_json())
        .await
        .unwrap();

    FailingStore::set(&harness.store.fail_writes, true);
    assert_eq!(
        intake.process_next().await.unwrap(),
        Some(IntakeDisposition::Requeued)
    );

    FailingStore::set(&harness.store.fail_writes, false);
    assert!(matches!(
        intake.process_next().await.unwrap(),
        Some(IntakeDisposition::Ingested(_))
    ));
    assert_eq!(intake.process_next().await.unwrap(), None);
}

#[tokio::test]
async fn runner_executes_admitted_run() {
    let harness = TestHarness::new();
    let runner = harness.runner();
    let id = harness
        .ingest(ReportBuilder::new("shop").build())
        .await
        .aggregate_id();
    harness
        .ingest(ReportBuilder::new("shop").at(10.0).build())
        .await;

    let disposition = runner.process_next().await.unwrap();

    let Some(RunDisposition::Executed(report)) = disposition else {
        panic!("expected an executed run, got {disposition:?}");
    };
    assert_eq!(report.committed, 1);
    assert_eq!(harness.aggregate(id).await.count, 2);
    assert!(harness.run_signals().await.is_empty());
    assert_eq!(runner.process_next().await.unwrap(), None);
}

#[tokio::test]
async fn runner_skips_superseded_runs() {
    let harness = TestHarness::new();
    let runner = harness.runner();
    for _ in 0..3 {
        harness.throttle.schedule().await.unwrap();
    }

    assert_eq!(
        runner.process_next().await.unwrap(),
        Some(RunDisposition::Skipped)
    );
    assert_eq!(
        runner.process_next().await.unwrap(),
        Some(RunDisposition::Skipped)
    );
    assert!(matches!(
        runner.process_next().await.unwrap(),
        Some(RunDisposition::Executed(_))
    ));
}

#[tokio::test]
async fn runner_discards_malformed_signal() {
    let harness = TestHarness::new();
    let runner = harness.runner();
    harness
        .queue
        .inner
        .publish(&harness.config.queues.runs, b"not a signal")
        .await
        .unwrap();

    assert_eq!(
        runner.process_next().await.unwrap(),
        Some(RunDisposition::Discarded)
    );
    assert!(harness.run_signals().await.is_empty());
}

#[tokio::test]
async fn loops_ingest_and_aggregate_until_cancelled() {
    let harness = TestHarness::with_config(fast_config());
    let intake = std::sync::Arc::new(harness.intake());
    let runner = std::sync::Arc::new(harness.runner());
    let cancel = CancellationToken::new();

    let intake_task = tokio::spawn({
        let intake = intake.clone();
        let cancel = cancel.clone();
        async move { intake.run(cancel).await }
    });
    let runner_task = tokio::spawn({
        let runner = runner.clone();
        let cancel = cancel.clone();
        async move { runner.run(cancel).await }
    });

    for offset in 0..3 {
        intake
            .submit(&ReportBuilder::new("shop").at(f64::from(offset)).to_json())
            .await
            .unwrap();
    }

    let mut count = 0;
    for _ in 0..200 {
        let aggregates = harness
            .store
            .list_aggregates(&Default::default())
            .await
            .unwrap();
        count = aggregates.first().map_or(0, |a| a.count);
        if count == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    cancel.cancel();
    intake_task.await.unwrap();
    runner_task.await.unwrap();

    assert_eq!(count, 3);
}

#[tokio::test(start_paused = true)]
async fn sweep_processes_tasks_without_signal() {
    let harness = TestHarness::with_config(fast_config());
    let id = harness
        .ingest(ReportBuilder::new("shop").build())
        .await
        .aggregate_id();
    harness
        .ingest(ReportBuilder::new("shop").at(1.0).build())
        .await;

    // Lose the run signal.
    let runs = &harness.config.queues.runs;
    let signal = harness
        .queue
        .inner
        .receive(runs, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    harness.queue.inner.ack(runs, &signal.id).await.unwrap();

    let runner = std::sync::Arc::new(harness.runner());
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let runner = runner.clone();
        let cancel = cancel.clone();
        async move { runner.run(cancel).await }
    });

    let mut count = 1;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        count = harness.aggregate(id).await.count;
        if count == 2 {
            break;
        }
    }

    cancel.cancel();
    task.await.unwrap();

    assert_eq!(count, 2);
}
