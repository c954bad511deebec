//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use logpipe::config::PipelineConfigBuilder;
use logpipe::sink::WriteResult;
use logpipe::{
    AppendAck, CheckpointStore, Event, IdempotentSink, IngestError, IngestResult, LogPayload,
    MemoryCheckpointStore, MemoryLog, MemorySink, Offset, PartitionId, PartitionRecord,
    PartitionedLog, PipelineConfig, RetryPolicy,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Valid event with a fixed id
pub fn event(id: impl Into<String>) -> Event {
    Event::with_id(id, LogPayload::new("api", "info", "request completed"))
}

/// Valid event with a fixed id and routing key
pub fn keyed_event(id: impl Into<String>, key: impl Into<String>) -> Event {
    event(id).routing_key(key)
}

/// Event the default sink schema refuses
pub fn malformed_event(id: impl Into<String>) -> Event {
    Event::with_id(id, LogPayload::new("api", "bogus", "level is not in the schema"))
}

/// Configuration tuned for fast tests
pub fn fast_config(partitions: u32) -> PipelineConfigBuilder {
    PipelineConfig::builder()
        .partition_count(partitions)
        .batch_size(50)
        .batch_timeout(Duration::from_millis(10))
        .write_batch_size(100)
        .write_batch_max_wait(Duration::from_millis(5))
        .prefetch(200)
        .poll_backoff(Duration::from_millis(1), Duration::from_millis(10))
        .operation_timeout(Duration::from_secs(5))
        .retry_policy(RetryPolicy::fixed(3, Duration::from_millis(1)))
        .metrics_interval(Duration::from_secs(60))
}

/// Append `ids` to one partition of a log
pub async fn seed(log: &MemoryLog, partition: PartitionId, ids: impl IntoIterator<Item = String>) {
    let events: Vec<Event> = ids.into_iter().map(event).collect();
    log.append(partition, events)
        .await
        .expect("seeding the log must succeed");
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .is_ok()
}

/// Log whose first `failures` appends fail
pub struct FlakyLog {
    pub inner: MemoryLog,
    failures_left: AtomicU32,
    pub append_calls: AtomicU64,
}

impl FlakyLog {
    pub fn new(partitions: u32, failures: u32) -> Self {
        Self {
            inner: MemoryLog::new(partitions),
            failures_left: AtomicU32::new(failures),
            append_calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl PartitionedLog for FlakyLog {
    fn partition_count(&self) -> u32 {
        self.inner.partition_count()
    }

    async fn append(&self, partition: PartitionId, events: Vec<Event>) -> IngestResult<AppendAck> {
        self.append_calls.fetch_add(1, Ordering::Relaxed);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(IngestError::LogAppend("leader unavailable".to_string()));
        }
        self.inner.append(partition, events).await
    }

    async fn read(
        &self,
        partition: PartitionId,
        from: Offset,
        max_records: usize,
    ) -> IngestResult<Vec<PartitionRecord>> {
        self.inner.read(partition, from, max_records).await
    }

    async fn end_offset(&self, partition: PartitionId) -> IngestResult<Offset> {
        self.inner.end_offset(partition).await
    }
}

/// Log whose appends block until the gate opens
pub struct GatedLog {
    pub inner: MemoryLog,
    gate: watch::Sender<bool>,
}

impl GatedLog {
    pub fn new(partitions: u32) -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            inner: MemoryLog::new(partitions),
            gate,
        }
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }
}

#[async_trait]
impl PartitionedLog for GatedLog {
    fn partition_count(&self) -> u32 {
        self.inner.partition_count()
    }

    async fn append(&self, partition: PartitionId, events: Vec<Event>) -> IngestResult<AppendAck> {
        let mut rx = self.gate.subscribe();
        rx.wait_for(|open| *open)
            .await
            .map_err(|e| IngestError::LogAppend(e.to_string()))?;
        self.inner.append(partition, events).await
    }

    async fn read(
        &self,
        partition: PartitionId,
        from: Offset,
        max_records: usize,
    ) -> IngestResult<Vec<PartitionRecord>> {
        self.inner.read(partition, from, max_records).await
    }

    async fn end_offset(&self, partition: PartitionId) -> IngestResult<Offset> {
        self.inner.end_offset(partition).await
    }
}

/// Sink whose first `failures` writes fail as a whole
pub struct FlakySink {
    pub inner: MemorySink,
    failures_left: AtomicU32,
}

impl FlakySink {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: MemorySink::new(),
            failures_left: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl IdempotentSink for FlakySink {
    async fn write_batch(&self, records: &[PartitionRecord]) -> IngestResult<WriteResult> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(IngestError::Sink("connection refused".to_string()));
        }
        self.inner.write_batch(records).await
    }
}

/// Sink whose writes block until the gate opens
pub struct GatedSink {
    pub inner: MemorySink,
    gate: watch::Sender<bool>,
}

impl GatedSink {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            inner: MemorySink::new(),
            gate,
        }
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }
}

#[async_trait]
impl IdempotentSink for GatedSink {
    async fn write_batch(&self, records: &[PartitionRecord]) -> IngestResult<WriteResult> {
        let mut rx = self.gate.subscribe();
        rx.wait_for(|open| *open)
            .await
            .map_err(|e| IngestError::Sink(e.to_string()))?;
        self.inner.write_batch(records).await
    }
}

/// Sink that refuses any batch containing `poison_id`, naming the record
pub struct PoisonSink {
    pub inner: MemorySink,
    poison_id: String,
    pub refusals: AtomicU64,
}

impl PoisonSink {
    pub fn new(poison_id: impl Into<String>) -> Self {
        Self {
            inner: MemorySink::new(),
            poison_id: poison_id.into(),
            refusals: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl IdempotentSink for PoisonSink {
    async fn write_batch(&self, records: &[PartitionRecord]) -> IngestResult<WriteResult> {
        if let Some(record) = records.iter().find(|r| r.event.id == self.poison_id) {
            self.refusals.fetch_add(1, Ordering::Relaxed);
            return Err(IngestError::PoisonRecord {
                offset: record.offset,
                id: record.event.id.clone(),
                reason: "value out of range for column".to_string(),
            });
        }
        self.inner.write_batch(records).await
    }
}

/// Checkpoint store that hangs forever once `allowed` commits have landed
pub struct StallingCheckpointStore {
    pub inner: Arc<MemoryCheckpointStore>,
    allowed: u64,
    commits: AtomicU64,
    stalled: AtomicBool,
}

impl StallingCheckpointStore {
    pub fn new(inner: Arc<MemoryCheckpointStore>, allowed: u64) -> Self {
        Self {
            inner,
            allowed,
            commits: AtomicU64::new(0),
            stalled: AtomicBool::new(false),
        }
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointStore for StallingCheckpointStore {
    async fn get(&self, partition: PartitionId, group: &str) -> IngestResult<Option<Offset>> {
        self.inner.get(partition, group).await
    }

    async fn set(&self, partition: PartitionId, group: &str, offset: Offset) -> IngestResult<()> {
        if self.commits.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            self.stalled.store(true, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
        self.inner.set(partition, group, offset).await
    }
}
