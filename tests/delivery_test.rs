//! At-least-once delivery: crash replay, retries and checkpoint ordering

mod common;

use common::*;
use logpipe::consumer::ConsumerSettings;
use logpipe::shutdown::ShutdownSignal;
use logpipe::{
    ConsumerState, IngestError, MemoryCheckpointStore, MemoryLog, MemorySink, PartitionConsumer,
    Pipeline, PipelineMetrics, RetryPolicy,
};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const GROUP: &str = "logpipe";

fn consumer_settings() -> ConsumerSettings {
    let config = fast_config(1)
        .operation_timeout(Duration::from_secs(60))
        .build();
    ConsumerSettings::from_config(&config)
}

#[tokio::test]
async fn test_crash_between_write_and_checkpoint_replays_without_duplicates() {
    let log = Arc::new(MemoryLog::new(1));
    for chunk in 0..10 {
        seed(&log, 0, (chunk * 100..(chunk + 1) * 100).map(|i| format!("evt-{}", i))).await;
    }

    let sink = Arc::new(MemorySink::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    let stalling = Arc::new(StallingCheckpointStore::new(store.clone(), 3));
    let metrics = Arc::new(PipelineMetrics::new());

    // First run: the fourth checkpoint never completes, then the task dies
    let shutdown = ShutdownSignal::new("first run");
    let consumer = PartitionConsumer::new(
        0,
        consumer_settings(),
        log.clone(),
        sink.clone(),
        stalling.clone(),
        metrics.clone(),
        shutdown.subscribe(),
    );
    let handle = tokio::spawn(consumer.run());

    assert!(wait_until(Duration::from_secs(5), || stalling.is_stalled()).await);
    assert_eq!(sink.len(), 400);
    assert_eq!(store.committed(0, GROUP), Some(299));

    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    // Second run resumes from the last durable checkpoint
    let shutdown = ShutdownSignal::new("second run");
    let consumer = PartitionConsumer::new(
        0,
        consumer_settings(),
        log.clone(),
        sink.clone(),
        store.clone(),
        metrics.clone(),
        shutdown.subscribe(),
    );
    let handle = tokio::spawn(consumer.run());

    assert!(wait_until(Duration::from_secs(5), || store.committed(0, GROUP) == Some(999)).await);
    shutdown.trigger();
    let report = handle.await.unwrap();

    assert_eq!(report.state, ConsumerState::Stopped);
    assert_eq!(report.committed_offset, Some(999));
    assert_eq!(sink.len(), 1000);
    assert_eq!(sink.duplicates_absorbed(), 100);
    assert_eq!(store.history(0, GROUP), vec![99, 199, 299, 399, 499, 599, 699, 799, 899, 999]);
}

#[tokio::test]
async fn test_shutdown_waits_for_inflight_write_and_checkpoint() {
    let log = Arc::new(MemoryLog::new(1));
    seed(&log, 0, (0..20).map(|i| format!("evt-{}", i))).await;

    let sink = Arc::new(GatedSink::new());
    let store = Arc::new(MemoryCheckpointStore::new());
    let shutdown = ShutdownSignal::new("inflight write");
    let consumer = PartitionConsumer::new(
        0,
        consumer_settings(),
        log.clone(),
        sink.clone(),
        store.clone(),
        Arc::new(PipelineMetrics::new()),
        shutdown.subscribe(),
    );
    let mut state = consumer.state();
    let handle = tokio::spawn(consumer.run());

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConsumerState::Writing),
    )
    .await
    .unwrap()
    .unwrap();

    shutdown.trigger();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!handle.is_finished());
    assert_eq!(store.committed(0, GROUP), None);

    sink.open();
    let report = handle.await.unwrap();

    assert_eq!(report.state, ConsumerState::Stopped);
    assert_eq!(report.committed_offset, Some(19));
    assert_eq!(store.history(0, GROUP), vec![19]);
    assert_eq!(sink.inner.len(), 20);
}

#[tokio::test]
async fn test_sink_outage_is_retried_until_it_recovers() {
    let log = Arc::new(MemoryLog::new(2));
    let sink = Arc::new(FlakySink::new(2));
    let store = Arc::new(MemoryCheckpointStore::new());

    let config = fast_config(2)
        .write_retry(RetryPolicy::fixed(5, Duration::from_millis(1)))
        .build();
    let pipeline = Pipeline::start(config, log.clone(), sink.clone(), store.clone()).unwrap();

    for i in 0..300 {
        pipeline.enqueue(event(format!("evt-{}", i))).unwrap();
    }

    let metrics = pipeline.metrics().clone();
    assert!(wait_until(Duration::from_secs(5), || metrics.rows_written() == 300).await);
    let report = pipeline.shutdown().await.unwrap();

    assert!(!report.has_halted());
    assert!(report.metrics.write_retries >= 2);
    let ids: HashSet<String> = sink.inner.rows().into_iter().map(|row| row.id).collect();
    assert_eq!(ids.len(), 300);
    for i in 0..300 {
        assert!(ids.contains(&format!("evt-{}", i)));
    }
}

#[tokio::test]
async fn test_exhausted_sink_retries_halt_without_checkpoint() {
    let log = Arc::new(MemoryLog::new(1));
    seed(&log, 0, (0..20).map(|i| format!("evt-{}", i))).await;

    let sink = Arc::new(FlakySink::new(u32::MAX));
    let store = Arc::new(MemoryCheckpointStore::new());
    let shutdown = ShutdownSignal::new("halting consumer");
    let consumer = PartitionConsumer::new(
        0,
        consumer_settings(),
        log,
        sink.clone(),
        store.clone(),
        Arc::new(PipelineMetrics::new()),
        shutdown.subscribe(),
    );

    let report = tokio::time::timeout(Duration::from_secs(5), consumer.run())
        .await
        .unwrap();

    assert_eq!(report.state, ConsumerState::Halted);
    assert_eq!(report.committed_offset, None);
    assert!(report.error.unwrap().contains("sink write"));
    assert!(store.history(0, GROUP).is_empty());
    assert!(sink.inner.is_empty());
}

#[tokio::test]
async fn test_checkpoints_strictly_increase_per_partition() {
    let log = Arc::new(MemoryLog::new(4));
    let store = Arc::new(MemoryCheckpointStore::new());
    let pipeline = Pipeline::start(
        fast_config(4).write_batch_size(37).build(),
        log.clone(),
        Arc::new(MemorySink::new()),
        store.clone(),
    )
    .unwrap();

    for i in 0..2000 {
        pipeline
            .enqueue(keyed_event(format!("evt-{}", i), format!("host-{}", i % 23)))
            .unwrap();
        if i % 250 == 0 {
            tokio::task::yield_now().await;
        }
    }

    let metrics = pipeline.metrics().clone();
    assert!(wait_until(Duration::from_secs(5), || metrics.rows_written() == 2000).await);
    pipeline.shutdown().await.unwrap();

    for partition in 0..4 {
        let history = store.history(partition, GROUP);
        assert!(history.windows(2).all(|w| w[0] < w[1]), "{:?}", history);
        if log.len(partition) > 0 {
            assert_eq!(history.last().copied(), Some(log.len(partition) as u64 - 1));
        }
    }
}

#[tokio::test]
async fn test_append_retry_recovers_and_receipt_reports_offset() {
    let log = Arc::new(FlakyLog::new(1, 2));
    let config = fast_config(1)
        .append_retry(RetryPolicy::fixed(3, Duration::from_millis(1)))
        .build();
    let pipeline = Pipeline::start(
        config,
        log.clone(),
        Arc::new(MemorySink::new()),
        Arc::new(MemoryCheckpointStore::new()),
    )
    .unwrap();

    let receipt = pipeline.enqueue_with_receipt(event("evt-0")).unwrap();
    let delivered = receipt.wait().await.unwrap();
    assert_eq!(delivered.partition, 0);
    assert_eq!(delivered.offset, 0);

    let report = pipeline.shutdown().await.unwrap();
    assert_eq!(report.metrics.append_retries, 2);
    assert_eq!(report.metrics.append_failures, 0);
}

#[tokio::test]
async fn test_append_exhaustion_fails_the_receipt() {
    let log = Arc::new(FlakyLog::new(1, u32::MAX));
    let config = fast_config(1)
        .append_retry(RetryPolicy::fixed(1, Duration::from_millis(1)))
        .build();
    let pipeline = Pipeline::start(
        config,
        log.clone(),
        Arc::new(MemorySink::new()),
        Arc::new(MemoryCheckpointStore::new()),
    )
    .unwrap();

    let receipt = pipeline.enqueue_with_receipt(event("evt-0")).unwrap();
    let err = receipt.wait().await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::RetriesExhausted { attempts: 2, .. }
    ));

    let report = pipeline.shutdown().await.unwrap();
    assert_eq!(report.metrics.append_failures, 1);
    assert_eq!(log.inner.total_len(), 0);
}
