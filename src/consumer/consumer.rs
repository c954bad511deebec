//! Per-partition consumer: poll, batch, write, checkpoint

use crate::checkpoint::CheckpointStore;
use crate::config::{PipelineConfig, StartPosition};
use crate::error::{IngestError, IngestResult};
use crate::event::{BatchBuilder, BatchLimits, Offset, PartitionId, PartitionRecord, Push};
use crate::log::PartitionedLog;
use crate::metrics::PipelineMetrics;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::shutdown::stopped;
use crate::sink::IdempotentSink;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// Lifecycle of a partition consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    /// Loading the last checkpoint
    Initializing,
    /// Reading records from the log
    Polling,
    /// Assembling a write batch
    Batching,
    /// Writing a batch to the sink
    Writing,
    /// Committing the checkpoint for the written batch
    Checkpointing,
    /// Shutdown observed, finishing up
    Stopping,
    /// Exited cleanly
    Stopped,
    /// Exited after retry exhaustion
    Halted,
}

impl ConsumerState {
    /// Whether the consumer has exited
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsumerState::Stopped | ConsumerState::Halted)
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Initializing => "initializing",
            ConsumerState::Polling => "polling",
            ConsumerState::Batching => "batching",
            ConsumerState::Writing => "writing",
            ConsumerState::Checkpointing => "checkpointing",
            ConsumerState::Stopping => "stopping",
            ConsumerState::Stopped => "stopped",
            ConsumerState::Halted => "halted",
        };
        f.write_str(name)
    }
}

/// Consumer tuning, derived from [`PipelineConfig`]
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Consumer group the checkpoints belong to
    pub group: String,
    /// Records read ahead of the current batch
    pub prefetch: usize,
    /// Write batch ceilings
    pub write_limits: BatchLimits,
    /// Longest wait for a write batch to fill
    pub write_max_wait: Duration,
    /// Initial idle poll delay
    pub poll_interval: Duration,
    /// Idle poll delay ceiling
    pub max_poll_backoff: Duration,
    /// Where to start without a checkpoint
    pub start_position: StartPosition,
    /// Per-attempt deadline for external calls
    pub operation_timeout: Duration,
    /// Retry policy for log reads
    pub read_retry: RetryPolicy,
    /// Retry policy for sink writes
    pub write_retry: RetryPolicy,
    /// Retry policy for checkpoint reads and writes
    pub checkpoint_retry: RetryPolicy,
}

impl ConsumerSettings {
    /// Settings for the pipeline configuration
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            group: config.consumer_group.clone(),
            prefetch: config.prefetch,
            write_limits: config.write_limits(),
            write_max_wait: config.write_batch_max_wait(),
            poll_interval: config.poll_interval(),
            max_poll_backoff: config.max_poll_backoff(),
            start_position: config.default_start_position,
            operation_timeout: config.operation_timeout(),
            read_retry: config.append_retry.clone(),
            write_retry: config.write_retry.clone(),
            checkpoint_retry: config.checkpoint_retry.clone(),
        }
    }
}

/// Final outcome of one consumer run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionReport {
    /// Partition consumed
    pub partition: PartitionId,
    /// Terminal state
    pub state: ConsumerState,
    /// Last committed offset
    pub committed_offset: Option<Offset>,
    /// Error that halted the consumer
    pub error: Option<String>,
}

/// Records pulled out of the log for one write
struct Batch {
    records: Vec<PartitionRecord>,
    /// Highest offset consumed, including records skipped as poison
    last_offset: Offset,
}

/// Proof that a batch reached the sink
///
/// Only the consumer's write step creates one, and checkpointing consumes
/// it, so a checkpoint can never run ahead of its write.
#[must_use = "a sunk batch must be checkpointed"]
#[derive(Debug)]
pub struct SunkBatch {
    last_offset: Offset,
    written: usize,
}

impl SunkBatch {
    /// Offset the checkpoint will record
    pub fn last_offset(&self) -> Offset {
        self.last_offset
    }

    /// Rows newly written by the batch
    pub fn written(&self) -> usize {
        self.written
    }
}

/// Drives one partition from its checkpoint to the sink
pub struct PartitionConsumer {
    partition: PartitionId,
    settings: ConsumerSettings,
    log: Arc<dyn PartitionedLog>,
    sink: Arc<dyn IdempotentSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    metrics: Arc<PipelineMetrics>,
    write_slots: Option<Arc<Semaphore>>,
    state_tx: watch::Sender<ConsumerState>,
    shutdown: watch::Receiver<bool>,
    pending: VecDeque<PartitionRecord>,
    next_read: Offset,
    committed: Option<Offset>,
    poll_backoff: Duration,
    read_retry: RetryExecutor,
    write_retry: RetryExecutor,
    checkpoint_retry: RetryExecutor,
}

impl PartitionConsumer {
    /// Create a consumer for `partition`
    pub fn new(
        partition: PartitionId,
        settings: ConsumerSettings,
        log: Arc<dyn PartitionedLog>,
        sink: Arc<dyn IdempotentSink>,
        checkpoints: Arc<dyn CheckpointStore>,
        metrics: Arc<PipelineMetrics>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConsumerState::Initializing);
        Self {
            partition,
            read_retry: RetryExecutor::new(settings.read_retry.clone()),
            write_retry: RetryExecutor::new(settings.write_retry.clone()),
            checkpoint_retry: RetryExecutor::new(settings.checkpoint_retry.clone()),
            poll_backoff: settings.poll_interval,
            settings,
            log,
            sink,
            checkpoints,
            metrics,
            write_slots: None,
            state_tx,
            shutdown,
            pending: VecDeque::new(),
            next_read: 0,
            committed: None,
        }
    }

    /// Share a limit on concurrent write/checkpoint cycles
    pub fn with_write_slots(mut self, slots: Arc<Semaphore>) -> Self {
        self.write_slots = Some(slots);
        self
    }

    /// Partition consumed
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Watch the consumer's state
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state_tx.subscribe()
    }

    /// Run until shutdown or retry exhaustion
    pub async fn run(mut self) -> PartitionReport {
        let result = self.drive().await;

        let (state, error) = match result {
            Ok(()) => {
                info!(
                    partition = self.partition,
                    group = %self.settings.group,
                    committed = ?self.committed,
                    "consumer stopped"
                );
                (ConsumerState::Stopped, None)
            }
            Err(e) => {
                error!(
                    partition = self.partition,
                    group = %self.settings.group,
                    committed = ?self.committed,
                    error = %e,
                    "consumer halted"
                );
                self.metrics.record_error(e.kind());
                (ConsumerState::Halted, Some(e.to_string()))
            }
        };
        self.set_state(state);

        PartitionReport {
            partition: self.partition,
            state,
            committed_offset: self.committed,
            error,
        }
    }

    async fn drive(&mut self) -> IngestResult<()> {
        self.set_state(ConsumerState::Initializing);
        self.initialize().await?;

        loop {
            self.set_state(ConsumerState::Polling);
            if self.shutdown_requested() {
                break;
            }

            if self.pending.is_empty() && self.poll().await? == 0 {
                self.idle().await;
                continue;
            }

            self.set_state(ConsumerState::Batching);
            let batch = self.assemble().await?;

            let _slot = self.acquire_write_slot().await?;
            self.set_state(ConsumerState::Writing);
            let sunk = self.write(batch).await?;

            self.set_state(ConsumerState::Checkpointing);
            self.checkpoint(sunk).await?;
        }

        self.set_state(ConsumerState::Stopping);
        Ok(())
    }

    async fn initialize(&mut self) -> IngestResult<()> {
        let partition = self.partition;
        let (committed, _) = self
            .checkpoint_retry
            .run("checkpoint read", self.settings.operation_timeout, || {
                let store = self.checkpoints.clone();
                let group = self.settings.group.clone();
                async move { store.get(partition, &group).await }
            })
            .await?;

        self.next_read = match (committed, self.settings.start_position) {
            (Some(offset), _) => offset + 1,
            (None, StartPosition::Earliest) => 0,
            (None, StartPosition::Latest) => {
                let (end, _) = self
                    .read_retry
                    .run("log end offset", self.settings.operation_timeout, || {
                        let log = self.log.clone();
                        async move { log.end_offset(partition).await }
                    })
                    .await?;
                end
            }
        };
        self.committed = committed;
        if let Some(offset) = committed {
            self.metrics.set_committed_offset(partition, offset);
        }

        info!(
            partition,
            group = %self.settings.group,
            committed = ?committed,
            next_read = self.next_read,
            "consumer initialized"
        );
        Ok(())
    }

    /// Read ahead into `pending`; returns the number of records read
    async fn poll(&mut self) -> IngestResult<usize> {
        let want = self.settings.prefetch.saturating_sub(self.pending.len());
        if want == 0 {
            return Ok(0);
        }

        let partition = self.partition;
        let from = self.next_read;
        let (records, _) = self
            .read_retry
            .run("log read", self.settings.operation_timeout, || {
                let log = self.log.clone();
                async move { log.read(partition, from, want).await }
            })
            .await?;

        let Some(last) = records.last() else {
            return Ok(0);
        };
        self.next_read = last.offset + 1;
        self.poll_backoff = self.settings.poll_interval;

        let count = records.len();
        self.metrics.add_polled(count as u64);
        self.pending.extend(records);
        Ok(count)
    }

    async fn idle(&mut self) {
        let delay = self.poll_backoff;
        self.poll_backoff = (delay * 2).min(self.settings.max_poll_backoff);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stopped(&mut self.shutdown) => {}
        }
    }

    async fn assemble(&mut self) -> IngestResult<Batch> {
        let mut builder = BatchBuilder::new(self.settings.write_limits);
        let mut last_offset = None;
        let deadline = Instant::now() + self.settings.write_max_wait;

        loop {
            while let Some(record) = self.pending.pop_front() {
                let offset = record.offset;
                match builder.push(record) {
                    Push::Added => last_offset = Some(offset),
                    Push::Full(record) => {
                        self.pending.push_front(record);
                        break;
                    }
                    Push::Oversized(record) => {
                        warn!(
                            partition = self.partition,
                            offset,
                            id = %record.event.id,
                            "record exceeds write batch ceiling, skipped as poison"
                        );
                        self.metrics.add_poison(1);
                        self.metrics.record_error("poison_record");
                        last_offset = Some(offset);
                    }
                }
            }

            let closed = builder.is_full() || !self.pending.is_empty();
            if closed || self.shutdown_requested() || Instant::now() >= deadline {
                break;
            }

            if self.poll().await? == 0 {
                let wait = self
                    .settings
                    .poll_interval
                    .min(deadline.saturating_duration_since(Instant::now()));
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = stopped(&mut self.shutdown) => {}
                }
            }
        }

        let records = builder.finish();
        let last_offset = last_offset.ok_or_else(|| {
            IngestError::LogRead(format!(
                "partition {} produced an empty batch",
                self.partition
            ))
        })?;
        debug!(
            partition = self.partition,
            records = records.len(),
            last_offset,
            "batch assembled"
        );
        Ok(Batch {
            records,
            last_offset,
        })
    }

    async fn acquire_write_slot(&self) -> IngestResult<Option<OwnedSemaphorePermit>> {
        match &self.write_slots {
            Some(slots) => slots
                .clone()
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|e| IngestError::Shutdown(e.to_string())),
            None => Ok(None),
        }
    }

    /// Write a batch, isolating poison records
    async fn write(&self, batch: Batch) -> IngestResult<SunkBatch> {
        let Batch {
            mut records,
            last_offset,
        } = batch;

        let mut seen = HashSet::with_capacity(records.len());
        let before = records.len();
        records.retain(|record| seen.insert(record.event.id.clone()));
        let mut duplicates = before - records.len();
        let mut written = 0;
        let started = Instant::now();

        while !records.is_empty() {
            let batch = &records;
            let result = self
                .write_retry
                .run("sink write", self.settings.operation_timeout, || {
                    let sink = self.sink.clone();
                    async move { sink.write_batch(batch).await }
                })
                .await;

            match result {
                Ok((outcome, retries)) => {
                    self.metrics.add_write_retries(retries as u64);
                    for rejected in &outcome.rejected {
                        warn!(
                            partition = self.partition,
                            offset = rejected.offset,
                            id = %rejected.id,
                            reason = %rejected.reason,
                            "poison record skipped"
                        );
                    }
                    if !outcome.rejected.is_empty() {
                        self.metrics.add_poison(outcome.rejected.len() as u64);
                        self.metrics.record_error("poison_record");
                    }
                    written += outcome.written;
                    duplicates += outcome.duplicates;
                    break;
                }
                Err(IngestError::PoisonRecord { offset, id, reason }) => {
                    warn!(
                        partition = self.partition,
                        offset,
                        id = %id,
                        reason = %reason,
                        "sink refused batch over poison record, resubmitting without it"
                    );
                    let len = records.len();
                    records.retain(|record| record.offset != offset);
                    if records.len() == len {
                        return Err(IngestError::PoisonRecord { offset, id, reason });
                    }
                    self.metrics.add_poison(1);
                    self.metrics.record_error("poison_record");
                }
                Err(e) => return Err(e),
            }
        }

        self.metrics.add_written(written as u64);
        self.metrics.add_duplicates(duplicates as u64);
        self.metrics.record_write_duration(started.elapsed());
        debug!(
            partition = self.partition,
            written,
            duplicates,
            last_offset,
            "batch written"
        );

        Ok(SunkBatch {
            last_offset,
            written,
        })
    }

    /// Commit the offset covered by a sunk batch
    async fn checkpoint(&mut self, sunk: SunkBatch) -> IngestResult<()> {
        let partition = self.partition;
        let offset = sunk.last_offset;

        if let Some(previous) = self.committed {
            if offset <= previous {
                return Err(IngestError::CheckpointRegression {
                    partition,
                    previous,
                    next: offset,
                });
            }
        }

        let started = Instant::now();
        let (_, retries) = self
            .checkpoint_retry
            .run("checkpoint commit", self.settings.operation_timeout, || {
                let store = self.checkpoints.clone();
                let group = self.settings.group.clone();
                async move { store.set(partition, &group, offset).await }
            })
            .await?;

        self.committed = Some(offset);
        self.metrics.add_checkpoint_retries(retries as u64);
        self.metrics
            .record_checkpoint(partition, offset, started.elapsed());
        debug!(partition, offset, written = sunk.written, "checkpoint committed");
        Ok(())
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(partition = self.partition, from = %previous, to = %state, "consumer state");
        }
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }
}
