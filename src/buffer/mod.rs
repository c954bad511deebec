//! Bounded ingestion buffer in front of the partitioned log
//!
//! `enqueue` only validates and queues; it never waits on the log. A flush
//! task drains the queue into size- or age-bounded batches and submits each
//! per-partition group to the log in its own task.

pub mod backpressure;

pub use backpressure::{BackpressureGauge, BackpressureStatus};

use crate::config::PipelineConfig;
use crate::error::{IngestError, IngestResult, Rejection};
use crate::event::{BatchBuilder, Event, Offset, PartitionId, Push};
use crate::log::PartitionedLog;
use crate::metrics::PipelineMetrics;
use crate::retry::RetryExecutor;
use crate::router::EventRouter;
use crate::shutdown::{stopped, ShutdownSignal};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

type ReceiptSender = oneshot::Sender<IngestResult<Delivered>>;

/// Immediate acknowledgement that events were buffered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// Events accepted by this call
    pub accepted: usize,
    /// Queue depth after acceptance
    pub depth: usize,
}

/// Where the log placed an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    /// Partition appended to
    pub partition: PartitionId,
    /// Offset assigned by the log
    pub offset: Offset,
}

/// Handle resolving to the append outcome of one event
#[derive(Debug)]
pub struct DeliveryReceipt {
    id: String,
    rx: oneshot::Receiver<IngestResult<Delivered>>,
}

impl DeliveryReceipt {
    /// Id of the tracked event
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the log to acknowledge the event, or for its final append error
    pub async fn wait(self) -> IngestResult<Delivered> {
        self.rx.await.map_err(IngestError::from)?
    }
}

/// Read-only view of the buffer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferStatus {
    /// Events queued and not yet flushed
    pub depth: usize,
    /// Queue capacity
    pub capacity: usize,
    /// `depth / capacity`
    pub utilization: f64,
    /// Whether the backpressure gauge is on
    pub under_pressure: bool,
    /// Append tasks currently running
    pub inflight_appends: usize,
    /// Whether the buffer refuses new events
    pub closed: bool,
}

struct Pending {
    event: Event,
    size: usize,
    queued: Instant,
    receipt: Option<ReceiptSender>,
}

#[derive(Default)]
struct Queue {
    items: VecDeque<Pending>,
    bytes: usize,
    closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushMode {
    /// Only batches that reached a ceiling
    Full,
    /// Full batches plus anything older than the batch timeout
    Aged,
    /// Everything
    All,
}

struct Shared {
    config: PipelineConfig,
    router: EventRouter,
    log: Arc<dyn PartitionedLog>,
    metrics: Arc<PipelineMetrics>,
    queue: Mutex<Queue>,
    notify: Notify,
    gauge: BackpressureGauge,
    inflight: Arc<Semaphore>,
    partition_locks: Vec<Arc<tokio::sync::Mutex<()>>>,
    retry: RetryExecutor,
}

/// Bounded multi-producer queue with a background flush task
pub struct IngestionBuffer {
    shared: Arc<Shared>,
    shutdown: ShutdownSignal,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl IngestionBuffer {
    /// Create the buffer and spawn its flush task
    pub fn start(
        config: PipelineConfig,
        router: EventRouter,
        log: Arc<dyn PartitionedLog>,
        metrics: Arc<PipelineMetrics>,
    ) -> IngestResult<Self> {
        config.validate()?;
        if router.partition_count() != log.partition_count() {
            return Err(IngestError::Config(format!(
                "router covers {} partitions but the log has {}",
                router.partition_count(),
                log.partition_count()
            )));
        }

        let shared = Arc::new(Shared {
            gauge: BackpressureGauge::new(
                config.buffer_capacity,
                config.pause_threshold,
                config.resume_threshold,
            ),
            inflight: Arc::new(Semaphore::new(config.max_inflight_appends)),
            partition_locks: (0..router.partition_count())
                .map(|_| Arc::new(tokio::sync::Mutex::new(())))
                .collect(),
            retry: RetryExecutor::new(config.append_retry.clone()),
            queue: Mutex::new(Queue::default()),
            notify: Notify::new(),
            config,
            router,
            log,
            metrics,
        });

        let shutdown = ShutdownSignal::new("ingestion buffer");
        let flusher = tokio::spawn(run_flusher(shared.clone(), shutdown.subscribe()));

        info!(
            capacity = shared.config.buffer_capacity,
            batch_size = shared.config.batch_size,
            partitions = shared.router.partition_count(),
            "ingestion buffer started"
        );

        Ok(Self {
            shared,
            shutdown,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Accept one event
    pub fn enqueue(&self, event: Event) -> Result<Accepted, Rejection> {
        self.shared.admit(vec![(event, None)])
    }

    /// Accept a batch of events, all or nothing
    pub fn enqueue_batch(&self, events: Vec<Event>) -> Result<Accepted, Rejection> {
        self.shared
            .admit(events.into_iter().map(|event| (event, None)).collect())
    }

    /// Accept one event and get a handle on its append outcome
    pub fn enqueue_with_receipt(&self, event: Event) -> Result<DeliveryReceipt, Rejection> {
        let (tx, rx) = oneshot::channel();
        let id = event.id.clone();
        self.shared.admit(vec![(event, Some(tx))])?;
        Ok(DeliveryReceipt { id, rx })
    }

    /// Events queued and not yet flushed
    pub fn depth(&self) -> usize {
        self.shared.queue.lock().items.len()
    }

    /// Current buffer status
    pub fn status(&self) -> BufferStatus {
        let (depth, closed) = {
            let queue = self.shared.queue.lock();
            (queue.items.len(), queue.closed)
        };
        BufferStatus {
            depth,
            capacity: self.shared.config.buffer_capacity,
            utilization: self.shared.gauge.utilization(depth),
            under_pressure: self.shared.gauge.under_pressure(),
            inflight_appends: self.shared.config.max_inflight_appends
                - self.shared.inflight.available_permits(),
            closed,
        }
    }

    /// Router used for partition selection
    pub fn router(&self) -> &EventRouter {
        &self.shared.router
    }

    /// Stop accepting, flush everything queued and wait for every append
    pub async fn shutdown(&self) -> IngestResult<()> {
        let started = Instant::now();
        self.shared.queue.lock().closed = true;
        self.shutdown.trigger();

        let handle = self.flusher.lock().take();
        if let Some(handle) = handle {
            handle
                .await
                .map_err(|e| IngestError::Shutdown(format!("flush task failed: {}", e)))?;
        }

        let max = self.shared.config.max_inflight_appends as u32;
        let _all = self
            .shared
            .inflight
            .acquire_many(max)
            .await
            .map_err(|e| IngestError::Shutdown(e.to_string()))?;

        info!(elapsed = ?started.elapsed(), "ingestion buffer drained");
        Ok(())
    }
}

impl Shared {
    fn validate(&self, event: &Event) -> Result<usize, Rejection> {
        if event.id.trim().is_empty() {
            return Err(Rejection::Invalid("event id is empty".to_string()));
        }
        if self.router.requires_key() && event.routing_key.is_none() {
            return Err(Rejection::Invalid(format!(
                "event {} has no routing key",
                event.id
            )));
        }
        let size = event.serialized_size();
        if size > self.config.max_event_bytes {
            return Err(Rejection::Invalid(format!(
                "event {} is {} bytes, limit is {}",
                event.id, size, self.config.max_event_bytes
            )));
        }
        Ok(size)
    }

    fn admit(&self, events: Vec<(Event, Option<ReceiptSender>)>) -> Result<Accepted, Rejection> {
        let count = events.len();
        let result = self.admit_inner(events);
        match &result {
            Ok(accepted) => {
                self.metrics.add_accepted(count as u64);
                self.gauge.observe(accepted.depth);
                if accepted.depth >= self.config.batch_size {
                    self.notify.notify_one();
                }
            }
            Err(rejection) => {
                self.metrics.add_rejected(count as u64);
                debug!(count, %rejection, "enqueue rejected");
            }
        }
        result
    }

    fn admit_inner(
        &self,
        events: Vec<(Event, Option<ReceiptSender>)>,
    ) -> Result<Accepted, Rejection> {
        let now = Utc::now();
        // size is measured on the event exactly as it will be appended
        let mut sized = Vec::with_capacity(events.len());
        for (mut event, receipt) in events {
            event.enqueued_at = now;
            let size = self.validate(&event)?;
            sized.push((event, size, receipt));
        }

        let queued = Instant::now();
        let capacity = self.config.buffer_capacity;

        let mut queue = self.queue.lock();
        if queue.closed {
            return Err(Rejection::Closed);
        }
        let depth = queue.items.len();
        if depth + sized.len() > capacity {
            return Err(Rejection::BufferFull { depth, capacity });
        }

        let accepted = sized.len();
        for (event, size, receipt) in sized {
            queue.bytes += size;
            queue.items.push_back(Pending {
                event,
                size,
                queued,
                receipt,
            });
        }

        Ok(Accepted {
            accepted,
            depth: queue.items.len(),
        })
    }

    /// Take the next batch from the front of the queue, if `mode` allows one
    fn take_batch(&self, mode: FlushMode) -> Option<Vec<Pending>> {
        let mut queue = self.queue.lock();
        let front = queue.items.front()?;

        let full = queue.items.len() >= self.config.batch_size
            || queue.bytes >= self.config.batch_max_bytes;
        let aged = front.queued.elapsed() >= self.config.batch_timeout();
        let take = match mode {
            FlushMode::Full => full,
            FlushMode::Aged => full || aged,
            FlushMode::All => true,
        };
        if !take {
            return None;
        }

        let mut builder = BatchBuilder::new(self.config.buffer_limits());
        while let Some(pending) = queue.items.pop_front() {
            let size = pending.size;
            match builder.push_sized(pending, size) {
                Push::Added => queue.bytes -= size,
                Push::Full(pending) => {
                    queue.items.push_front(pending);
                    break;
                }
                Push::Oversized(pending) => {
                    queue.bytes -= size;
                    warn!(
                        id = %pending.event.id,
                        size,
                        "event exceeds batch byte ceiling, dropped"
                    );
                    if let Some(tx) = pending.receipt {
                        let _ = tx.send(Err(IngestError::LogAppend(format!(
                            "event of {} bytes exceeds batch_max_bytes",
                            size
                        ))));
                    }
                }
            }
        }
        let depth = queue.items.len();
        drop(queue);

        self.gauge.observe(depth);
        let batch = builder.finish();
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    async fn flush(self: &Arc<Self>, mode: FlushMode) {
        while let Some(batch) = self.take_batch(mode) {
            self.submit(batch).await;
        }
    }

    async fn submit(self: &Arc<Self>, batch: Vec<Pending>) {
        self.metrics.add_batches_flushed(1);
        debug!(events = batch.len(), "flushing batch");

        let groups = match self.router.partition_items(batch, |pending| &pending.event) {
            Ok(groups) => groups,
            Err(e) => {
                // unreachable for events that passed enqueue validation
                error!(error = %e, "failed to route batch");
                self.metrics.record_error(e.kind());
                return;
            }
        };

        for (partition, items) in groups {
            let permit = match self.inflight.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(partition, error = %e, "append semaphore closed");
                    fail_receipts(items, &IngestError::Shutdown(e.to_string()));
                    continue;
                }
            };
            let lock = self.partition_locks[partition as usize]
                .clone()
                .lock_owned()
                .await;

            let shared = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let _lock = lock;
                shared.append_group(partition, items).await;
            });
        }
    }

    async fn append_group(&self, partition: PartitionId, items: Vec<Pending>) {
        let count = items.len();
        let (events, receipts): (Vec<Event>, Vec<Option<ReceiptSender>>) = items
            .into_iter()
            .map(|pending| (pending.event, pending.receipt))
            .unzip();

        let started = Instant::now();
        let result = self
            .retry
            .run("log append", self.config.operation_timeout(), || {
                let log = self.log.clone();
                let events = events.clone();
                async move { log.append(partition, events).await }
            })
            .await;

        match result {
            Ok((ack, retries)) => {
                self.metrics.add_appended(count as u64);
                self.metrics.add_append_retries(retries as u64);
                self.metrics.record_append_duration(started.elapsed());
                debug!(
                    partition,
                    first_offset = ack.first_offset,
                    last_offset = ack.last_offset,
                    retries,
                    "batch appended"
                );

                for (i, receipt) in receipts.into_iter().enumerate() {
                    if let Some(tx) = receipt {
                        let _ = tx.send(Ok(Delivered {
                            partition,
                            offset: ack.first_offset + i as Offset,
                        }));
                    }
                }
            }
            Err(e) => {
                error!(partition, events = count, error = %e, "append failed, events dropped");
                self.metrics.add_append_failures(count as u64);
                self.metrics.record_error(e.kind());
                for tx in receipts.into_iter().flatten() {
                    let _ = tx.send(Err(replicate(&e)));
                }
            }
        }
    }
}

async fn run_flusher(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let tick = (shared.config.batch_timeout() / 2).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = shared.notify.notified() => shared.flush(FlushMode::Full).await,
            _ = ticker.tick() => shared.flush(FlushMode::Aged).await,
        }
    }

    shared.flush(FlushMode::All).await;
    debug!("flush task exited");
}

fn fail_receipts(items: Vec<Pending>, error: &IngestError) {
    for tx in items.into_iter().filter_map(|pending| pending.receipt) {
        let _ = tx.send(Err(replicate(error)));
    }
}

/// Copy of an error for fan-out to several receipts
fn replicate(error: &IngestError) -> IngestError {
    match error {
        IngestError::RetriesExhausted {
            operation,
            attempts,
            last_error,
        } => IngestError::RetriesExhausted {
            operation: operation.clone(),
            attempts: *attempts,
            last_error: last_error.clone(),
        },
        IngestError::InvalidPartition { partition, count } => IngestError::InvalidPartition {
            partition: *partition,
            count: *count,
        },
        IngestError::Shutdown(msg) => IngestError::Shutdown(msg.clone()),
        other => IngestError::LogAppend(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingPolicy;
    use crate::event::LogPayload;
    use crate::log::MemoryLog;
    use crate::retry::RetryPolicy;

    fn config() -> PipelineConfig {
        PipelineConfig::builder()
            .partition_count(2)
            .batch_size(10)
            .buffer_capacity(20)
            .batch_timeout(Duration::from_millis(20))
            .retry_policy(RetryPolicy::fixed(2, Duration::from_millis(1)))
            .build()
    }

    fn start(config: PipelineConfig) -> (IngestionBuffer, Arc<MemoryLog>) {
        let log = Arc::new(MemoryLog::new(config.partition_count));
        let router = EventRouter::new(
            config.routing_policy,
            config.partition_count,
            config.round_robin_fallback,
        )
        .unwrap();
        let buffer = IngestionBuffer::start(
            config,
            router,
            log.clone(),
            Arc::new(PipelineMetrics::new()),
        )
        .unwrap();
        (buffer, log)
    }

    fn event(i: usize) -> Event {
        Event::with_id(format!("e-{}", i), LogPayload::new("api", "info", "m"))
    }

    #[tokio::test]
    async fn test_rejects_when_full() {
        let (buffer, _log) = start(
            PipelineConfig::builder()
                .partition_count(1)
                .batch_size(5)
                .buffer_capacity(5)
                .batch_timeout(Duration::from_secs(60))
                .build(),
        );
        // a full batch wakes the flusher, so fill through one all-or-nothing call
        let rejected = buffer.enqueue_batch((0..6).map(event).collect()).unwrap_err();
        assert_eq!(
            rejected,
            Rejection::BufferFull {
                depth: 0,
                capacity: 5
            }
        );
        assert_eq!(buffer.depth(), 0);
        buffer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_events_rejected() {
        let (buffer, _log) = start(
            PipelineConfig::builder()
                .partition_count(2)
                .routing_policy(RoutingPolicy::KeyHash)
                .round_robin_fallback(false)
                .build(),
        );

        let missing_key = buffer.enqueue(event(1)).unwrap_err();
        assert!(matches!(missing_key, Rejection::Invalid(_)));

        let empty_id = Event::with_id("", LogPayload::new("api", "info", "m")).routing_key("k");
        assert!(matches!(
            buffer.enqueue(empty_id).unwrap_err(),
            Rejection::Invalid(_)
        ));

        assert!(buffer.enqueue(event(2).routing_key("k")).is_ok());
        buffer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_receipt_reports_offset() {
        let (buffer, log) = start(config());
        let receipt = buffer.enqueue_with_receipt(event(0)).unwrap();
        let delivered = receipt.wait().await.unwrap();

        assert_eq!(delivered.offset, 0);
        assert_eq!(log.len(delivered.partition), 1);
        buffer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue_and_closes() {
        let (buffer, log) = start(
            PipelineConfig::builder()
                .partition_count(2)
                .batch_size(100)
                .buffer_capacity(1000)
                .batch_timeout(Duration::from_secs(60))
                .build(),
        );

        buffer.enqueue_batch((0..37).map(event).collect()).unwrap();
        buffer.shutdown().await.unwrap();

        assert_eq!(log.total_len(), 37);
        assert_eq!(buffer.enqueue(event(99)).unwrap_err(), Rejection::Closed);
        assert!(buffer.status().closed);
    }

    #[tokio::test]
    async fn test_key_order_preserved_per_partition() {
        let (buffer, log) = start(
            PipelineConfig::builder()
                .partition_count(3)
                .routing_policy(RoutingPolicy::KeyHash)
                .batch_size(7)
                .buffer_capacity(1000)
                .build(),
        );

        for i in 0..200 {
            let key = format!("k{}", i % 5);
            buffer.enqueue(event(i).routing_key(key)).unwrap();
        }
        buffer.shutdown().await.unwrap();

        for partition in 0..3 {
            let mut last_by_key = std::collections::HashMap::new();
            for record in log.snapshot(partition) {
                let n: usize = record.event.id[2..].parse().unwrap();
                let key = record.event.routing_key.clone().unwrap();
                if let Some(prev) = last_by_key.insert(key, n) {
                    assert!(prev < n, "out of order on partition {}", partition);
                }
            }
        }
        assert_eq!(log.total_len(), 200);
    }

    /// Records the encoded size of every appended group
    struct SizingLog {
        inner: MemoryLog,
        groups: Mutex<Vec<usize>>,
    }

    #[async_trait::async_trait]
    impl PartitionedLog for SizingLog {
        fn partition_count(&self) -> u32 {
            self.inner.partition_count()
        }

        async fn append(
            &self,
            partition: PartitionId,
            events: Vec<Event>,
        ) -> IngestResult<crate::log::AppendAck> {
            let bytes = events.iter().map(Event::serialized_size).sum();
            self.groups.lock().push(bytes);
            self.inner.append(partition, events).await
        }

        async fn read(
            &self,
            partition: PartitionId,
            from: Offset,
            max_records: usize,
        ) -> IngestResult<Vec<crate::event::PartitionRecord>> {
            self.inner.read(partition, from, max_records).await
        }

        async fn end_offset(&self, partition: PartitionId) -> IngestResult<Offset> {
            self.inner.end_offset(partition).await
        }
    }

    fn whole_second_event(id: &str) -> Event {
        let at = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut event = Event::with_id(id, LogPayload::new("api", "info", "m"));
        event.payload.timestamp = at;
        event.enqueued_at = at;
        event
    }

    #[tokio::test]
    async fn test_appended_groups_respect_byte_ceiling() {
        let limit = 4 * event(0).serialized_size() + 40;
        let config = PipelineConfig::builder()
            .partition_count(2)
            .batch_size(50)
            .batch_max_bytes(limit)
            .max_event_bytes(limit / 2)
            .buffer_capacity(500)
            .batch_timeout(Duration::from_millis(5))
            .build();
        let log = Arc::new(SizingLog {
            inner: MemoryLog::new(2),
            groups: Mutex::new(Vec::new()),
        });
        let router = EventRouter::new(config.routing_policy, 2, true).unwrap();
        let buffer =
            IngestionBuffer::start(config, router, log.clone(), Arc::new(PipelineMetrics::new()))
                .unwrap();

        for i in 0..120 {
            let payload = LogPayload::new("api", "info", "x".repeat(i % 9));
            buffer
                .enqueue(Event::with_id(format!("e-{}", i), payload))
                .unwrap();
        }
        buffer.shutdown().await.unwrap();

        assert_eq!(log.inner.total_len(), 120);
        let groups = log.groups.lock();
        assert!(groups.len() > 1);
        for bytes in groups.iter() {
            assert!(*bytes <= limit, "group of {} bytes over {}", bytes, limit);
        }
    }

    #[tokio::test]
    async fn test_event_measured_after_acceptance_stamp() {
        let stamped = whole_second_event("e-0");
        let limit = stamped.serialized_size();
        let (buffer, log) = start(
            PipelineConfig::builder()
                .partition_count(1)
                .max_event_bytes(limit)
                .batch_max_bytes(limit)
                .write_batch_max_bytes(limit)
                .build(),
        );

        // acceptance restamps enqueued_at, which may lengthen the encoding
        let accepted = buffer.enqueue(stamped).is_ok();
        buffer.shutdown().await.unwrap();

        let stored = log.snapshot(0);
        assert_eq!(stored.len(), accepted as usize);
        for record in stored {
            assert!(record.event.serialized_size() <= limit);
        }
    }
}
