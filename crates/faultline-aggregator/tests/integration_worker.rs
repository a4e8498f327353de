//! Integration tests for batched aggregation.

mod common;

use std::sync::atomic::Ordering;

use common::fixtures::{FailingStore, ReportBuilder};
use common::TestHarness;
use faultline_aggregator::{
    AggregateId, AggregationTask, AggregatorConfig, BatchReport, InstanceId, PartialAggregate,
};
use faultline_state::QueueBackend;

/// Creates an aggregate and `extra` deferred occurrences of it, one second apart.
async fn aggregate_with_pointers(harness: &TestHarness, extra: usize) -> AggregateId {
    let id = harness
        .ingest(ReportBuilder::new("shop").build())
        .await
        .aggregate_id();

    for i in 1..=extra {
        #[allow(clippy::cast_precision_loss)]
        let offset = i as f64;
        harness
            .ingest(
                ReportBuilder::new("shop")
                    .with_server(&format!("web-{i}"))
                    .at(offset)
                    .build(),
            )
            .await;
    }

    id
}

#[tokio::test]
async fn scenario_b_locked_aggregate_becomes_one_merged_task() {
    let harness = TestHarness::new();
    let id = aggregate_with_pointers(&harness, 10).await;
    let signals_before = harness.run_signals().await.len();

    let guard = harness.hold_lock(id).await;
    let report = harness.worker.run_batch().await.unwrap();

    assert_eq!(
        report,
        BatchReport {
            leased: 10,
            retried: 1,
            failed: 1,
            ..BatchReport::default()
        }
    );

    let tasks = harness.aggregation_tasks().await;
    assert_eq!(tasks.len(), 1);
    let AggregationTask::Merged {
        aggregate_id,
        partial,
    } = &tasks[0]
    else {
        panic!("expected a merged task, got {:?}", tasks[0]);
    };
    assert_eq!(*aggregate_id, id);
    assert_eq!(partial.count, 10);
    assert_eq!(partial.servers.len(), 10);

    // One follow-up run per failed group.
    assert_eq!(harness.run_signals().await.len(), signals_before + 1);
    assert_eq!(harness.aggregate(id).await.count, 1);

    guard.release().await.unwrap();
    let report = harness.worker.run_batch().await.unwrap();

    assert_eq!(report.committed, 1);
    let aggregate = harness.aggregate(id).await;
    assert_eq!(aggregate.count, 11);
    assert_eq!(aggregate.servers.len(), 10);
    assert!(harness.aggregation_tasks().await.is_empty());
}

#[tokio::test]
async fn merged_and_pointer_tasks_reduce_together() {
    let harness = TestHarness::new();
    let id = aggregate_with_pointers(&harness, 3).await;

    let guard = harness.hold_lock(id).await;
    harness.worker.run_batch().await.unwrap();
    guard.release().await.unwrap();

    harness
        .ingest(ReportBuilder::new("shop").with_server("late").at(100.0).build())
        .await;
    assert_eq!(harness.aggregation_tasks().await.len(), 2);

    let report = harness.worker.run_batch().await.unwrap();

    assert_eq!(report.leased, 2);
    assert_eq!(report.committed, 1);
    let aggregate = harness.aggregate(id).await;
    assert_eq!(aggregate.count, 5);
    assert!(aggregate.servers.contains("late"));
}

#[tokio::test]
async fn failed_update_is_retried_without_double_counting() {
    let harness = TestHarness::new();
    let id = aggregate_with_pointers(&harness, 4).await;

    FailingStore::set(&harness.store.fail_updates, true);
    let report = harness.worker.run_batch().await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(harness.aggregate(id).await.count, 1);

    FailingStore::set(&harness.store.fail_updates, false);
    harness.worker.run_batch().await.unwrap();
    harness.worker.run_batch().await.unwrap();

    assert_eq!(harness.aggregate(id).await.count, 5);
    assert!(harness.aggregation_tasks().await.is_empty());
}

#[tokio::test]
async fn deactivation_during_commit_is_kept() {
    let harness = TestHarness::new();
    let id = aggregate_with_pointers(&harness, 1).await;

    harness
        .store
        .deactivate_before_update
        .store(true, Ordering::SeqCst);
    let report = harness.worker.run_batch().await.unwrap();
    assert_eq!(report.committed, 1);

    let aggregate = harness.aggregate(id).await;
    assert!(!aggregate.active);
    assert_eq!(aggregate.count, 2);

    let outcome = harness.ingest(ReportBuilder::new("shop").at(9.0).build()).await;
    assert_ne!(outcome.aggregate_id(), id);
}

#[tokio::test]
async fn deactivation_after_commit_keeps_merged_counts() {
    let harness = TestHarness::new();
    let id = aggregate_with_pointers(&harness, 3).await;

    harness.worker.run_batch().await.unwrap();
    let deactivated = harness.queries.deactivate(&id).await.unwrap();

    assert!(!deactivated.active);
    assert_eq!(deactivated.count, 4);
    assert_eq!(deactivated.servers.len(), 3);
}

#[tokio::test]
async fn out_of_order_occurrences_keep_latest_snapshot() {
    let harness = TestHarness::new();
    let id = harness
        .ingest(ReportBuilder::new("shop").with_message("middle").at(100.0).build())
        .await
        .aggregate_id();

    for (offset, message) in [(50.0, "earliest"), (200.0, "latest"), (150.0, "later")] {
        harness
            .ingest(ReportBuilder::new("shop").with_message(message).at(offset).build())
            .await;
    }

    harness.worker.run_batch().await.unwrap();

    let aggregate = harness.aggregate(id).await;
    assert_eq!(aggregate.count, 4);
    assert_eq!(aggregate.first_occurrence.timestamp(), 1_700_000_050);
    assert_eq!(aggregate.last_occurrence.timestamp(), 1_700_000_200);
    assert_eq!(aggregate.last_message, "latest");
    assert!(aggregate.backtrace.contains("latest"));
}

#[tokio::test]
async fn malformed_tasks_are_discarded() {
    let harness = TestHarness::new();
    let queue = &harness.config.queues.aggregation;
    harness.queue.inner.publish(queue, b"not json").await.unwrap();
    harness
        .queue
        .inner
        .publish(queue, br#"{"kind":"mystery"}"#)
        .await
        .unwrap();

    let report = harness.worker.run_batch().await.unwrap();

    assert_eq!(report.leased, 2);
    assert_eq!(report.malformed, 2);
    assert_eq!(harness.queue.inner.len(queue).await, 0);
}

#[tokio::test]
async fn pointer_to_missing_instance_is_stale() {
    let harness = TestHarness::new();
    let id = aggregate_with_pointers(&harness, 1).await;
    let stale = AggregationTask::Pointer {
        aggregate_id: id,
        instance_id: InstanceId::generate(),
        backtrace: "gone".to_string(),
    };
    harness
        .queue
        .inner
        .publish(&harness.config.queues.aggregation, &stale.encode().unwrap())
        .await
        .unwrap();

    let report = harness.worker.run_batch().await.unwrap();

    assert_eq!(report.stale, 1);
    assert_eq!(report.committed, 1);
    assert_eq!(harness.aggregate(id).await.count, 2);
    assert!(harness.aggregation_tasks().await.is_empty());
}

#[tokio::test]
async fn tasks_for_missing_aggregate_are_orphaned() {
    let harness = TestHarness::new();
    let template = ReportBuilder::new("shop").build();
    let instance_at = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    let orphan = AggregationTask::Merged {
        aggregate_id: AggregateId::generate(),
        partial: PartialAggregate {
            count: 3,
            first_occurrence: instance_at,
            last_occurrence: instance_at,
            last_message: template.message().to_string(),
            backtrace: template.backtrace().to_string(),
            environments: Default::default(),
            servers: Default::default(),
        },
    };
    harness
        .queue
        .inner
        .publish(&harness.config.queues.aggregation, &orphan.encode().unwrap())
        .await
        .unwrap();

    let report = harness.worker.run_batch().await.unwrap();

    assert_eq!(report.orphaned, 1);
    assert_eq!(report.failed, 0);
    assert!(harness.aggregation_tasks().await.is_empty());
}

#[tokio::test]
async fn instance_read_failure_leaves_pointer_groups_leased() {
    let mut config = AggregatorConfig::default();
    config.worker.lease_ttl_secs = 0;
    let harness = TestHarness::with_config(config);
    let id = aggregate_with_pointers(&harness, 3).await;

    FailingStore::set(&harness.store.fail_instance_reads, true);
    let report = harness.worker.run_batch().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.retried, 0);
    assert_eq!(harness.aggregation_tasks().await.len(), 3);

    FailingStore::set(&harness.store.fail_instance_reads, false);
    let report = harness.worker.run_batch().await.unwrap();

    assert_eq!(report.committed, 1);
    assert_eq!(harness.aggregate(id).await.count, 4);
}

#[tokio::test]
async fn failed_task_delete_enqueues_no_retry() {
    let harness = TestHarness::new();
    let id = aggregate_with_pointers(&harness, 3).await;

    let guard = harness.hold_lock(id).await;
    harness.queue.fail_ack_batch.store(true, Ordering::SeqCst);
    let report = harness.worker.run_batch().await.unwrap();
    guard.release().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.retried, 0);
    let tasks = harness.aggregation_tasks().await;
    assert_eq!(tasks.len(), 3);
    assert!(tasks
        .iter()
        .all(|t| matches!(t, AggregationTask::Pointer { .. })));
}

#[tokio::test]
async fn committed_group_with_failed_delete_is_redelivered() {
    let mut config = AggregatorConfig::default();
    config.worker.lease_ttl_secs = 0;
    let harness = TestHarness::with_config(config);
    let id = aggregate_with_pointers(&harness, 2).await;

    harness.queue.fail_ack_batch.store(true, Ordering::SeqCst);
    let report = harness.worker.run_batch().await.unwrap();

    assert_eq!(report.committed, 1);
    assert_eq!(harness.aggregate(id).await.count, 3);
    assert_eq!(harness.aggregation_tasks().await.len(), 2);

    // At-least-once: the surviving tasks are applied again.
    harness.queue.fail_ack_batch.store(false, Ordering::SeqCst);
    harness.worker.run_batch().await.unwrap();

    assert_eq!(harness.aggregate(id).await.count, 5);
    assert!(harness.aggregation_tasks().await.is_empty());
}

#[tokio::test]
async fn lease_failure_mid_batch_keeps_partial_batch() {
    let mut config = AggregatorConfig::default();
    config.worker.lease_chunk = 2;
    config.worker.batch_cap = 10;
    let harness = TestHarness::with_config(config);
    let id = aggregate_with_pointers(&harness, 5).await;

    harness.queue.lease_budget.store(1, Ordering::SeqCst);
    let report = harness.worker.run_batch().await.unwrap();

    assert_eq!(report.leased, 2);
    assert_eq!(report.committed, 1);
    assert_eq!(harness.aggregate(id).await.count, 3);
}

#[tokio::test]
async fn lease_failure_on_first_call_is_an_error() {
    let harness = TestHarness::new();
    aggregate_with_pointers(&harness, 1).await;

    harness.queue.lease_budget.store(0, Ordering::SeqCst);

    assert!(harness.worker.run_batch().await.is_err());
}

#[tokio::test]
async fn batch_is_capped() {
    let mut config = AggregatorConfig::default();
    config.worker.lease_chunk = 3;
    config.worker.batch_cap = 7;
    let harness = TestHarness::with_config(config);
    let id = aggregate_with_pointers(&harness, 10).await;

    let report = harness.worker.run_batch().await.unwrap();
    assert_eq!(report.leased, 7);
    assert_eq!(harness.aggregate(id).await.count, 8);

    let report = harness.worker.run_batch().await.unwrap();
    assert_eq!(report.leased, 3);
    assert_eq!(harness.aggregate(id).await.count, 11);
}

#[tokio::test]
async fn empty_queue_is_a_no_op() {
    let harness = TestHarness::new();

    let report = harness.worker.run_batch().await.unwrap();

    assert!(report.is_empty());
    assert!(harness.run_signals().await.is_empty());
}
