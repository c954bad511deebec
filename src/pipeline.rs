//! End-to-end pipeline: buffer in front of the log, consumers behind it

use crate::buffer::{Accepted, BufferStatus, DeliveryReceipt, IngestionBuffer};
use crate::checkpoint::CheckpointStore;
use crate::config::PipelineConfig;
use crate::consumer::{ConsumerPool, PartitionReport, PartitionStatus};
use crate::error::{IngestError, IngestResult, Rejection};
use crate::event::Event;
use crate::log::PartitionedLog;
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::router::EventRouter;
use crate::shutdown::{stopped, ShutdownSignal};
use crate::sink::IdempotentSink;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Buffer depth plus per-partition consumer state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    /// Ingestion buffer
    pub buffer: BufferStatus,
    /// Partition consumers
    pub partitions: Vec<PartitionStatus>,
}

/// Outcome of a graceful shutdown
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Final report of every partition consumer
    pub partitions: Vec<PartitionReport>,
    /// Metrics at the end of shutdown
    pub metrics: MetricsSnapshot,
    /// Time spent shutting down
    pub elapsed: Duration,
}

impl ShutdownReport {
    /// Whether any consumer halted
    pub fn has_halted(&self) -> bool {
        self.partitions.iter().any(|p| p.error.is_some())
    }
}

/// Log ingestion pipeline
///
/// ```no_run
/// use logpipe::{Event, LogPayload, MemoryCheckpointStore, MemoryLog, MemorySink};
/// use logpipe::{Pipeline, PipelineConfig};
/// use std::sync::Arc;
///
/// # async fn example() -> logpipe::IngestResult<()> {
/// let config = PipelineConfig::builder().partition_count(4).build();
/// let pipeline = Pipeline::start(
///     config,
///     Arc::new(MemoryLog::new(4)),
///     Arc::new(MemorySink::new()),
///     Arc::new(MemoryCheckpointStore::new()),
/// )?;
///
/// let event = Event::new(LogPayload::new("checkout", "error", "payment declined"));
/// if let Err(rejection) = pipeline.enqueue(event) {
///     eprintln!("dropped: {}", rejection);
/// }
///
/// let report = pipeline.shutdown().await?;
/// println!("{} rows written", report.metrics.rows_written);
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    buffer: IngestionBuffer,
    pool: ConsumerPool,
    metrics: Arc<PipelineMetrics>,
    reporter_shutdown: ShutdownSignal,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Validate the configuration and start every component
    pub fn start(
        config: PipelineConfig,
        log: Arc<dyn PartitionedLog>,
        sink: Arc<dyn IdempotentSink>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> IngestResult<Self> {
        Self::start_with_metrics(config, log, sink, checkpoints, Arc::new(PipelineMetrics::new()))
    }

    /// Like [`start`](Self::start) with a caller-owned metrics collector
    pub fn start_with_metrics(
        config: PipelineConfig,
        log: Arc<dyn PartitionedLog>,
        sink: Arc<dyn IdempotentSink>,
        checkpoints: Arc<dyn CheckpointStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> IngestResult<Self> {
        config.validate()?;
        if log.partition_count() != config.partition_count {
            return Err(IngestError::Config(format!(
                "log has {} partitions, configuration expects {}",
                log.partition_count(),
                config.partition_count
            )));
        }

        let router = EventRouter::new(
            config.routing_policy,
            config.partition_count,
            config.round_robin_fallback,
        )?;
        let buffer = IngestionBuffer::start(config.clone(), router, log.clone(), metrics.clone())?;
        let pool = ConsumerPool::start(&config, log, sink, checkpoints, metrics.clone())?;

        let reporter_shutdown = ShutdownSignal::new("metrics reporter");
        let reporter = tokio::spawn(run_reporter(
            metrics.clone(),
            config.metrics_interval(),
            reporter_shutdown.subscribe(),
        ));

        info!(
            partitions = config.partition_count,
            routing = ?config.routing_policy,
            group = %config.consumer_group,
            "pipeline started"
        );

        Ok(Self {
            config,
            buffer,
            pool,
            metrics,
            reporter_shutdown,
            reporter: Mutex::new(Some(reporter)),
        })
    }

    /// Buffer one event
    pub fn enqueue(&self, event: Event) -> Result<Accepted, Rejection> {
        self.buffer.enqueue(event)
    }

    /// Buffer a batch of events, all or nothing
    pub fn enqueue_batch(&self, events: Vec<Event>) -> Result<Accepted, Rejection> {
        self.buffer.enqueue_batch(events)
    }

    /// Buffer one event and track its append
    pub fn enqueue_with_receipt(&self, event: Event) -> Result<DeliveryReceipt, Rejection> {
        self.buffer.enqueue_with_receipt(event)
    }

    /// Buffer depth and partition states
    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            buffer: self.buffer.status(),
            partitions: self.pool.statuses(),
        }
    }

    /// Shared metrics collector
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Configuration in use
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Drain the buffer into the log, stop the consumers, then stop reporting
    pub async fn shutdown(&self) -> IngestResult<ShutdownReport> {
        let started = Instant::now();
        info!("pipeline shutdown started");

        self.buffer.shutdown().await?;
        let partitions = self.pool.shutdown().await;

        self.reporter_shutdown.trigger();
        let reporter = self.reporter.lock().take();
        if let Some(reporter) = reporter {
            reporter
                .await
                .map_err(|e| IngestError::Shutdown(format!("metrics reporter failed: {}", e)))?;
        }

        let report = ShutdownReport {
            partitions,
            metrics: self.metrics.snapshot(),
            elapsed: started.elapsed(),
        };
        info!(
            elapsed = ?report.elapsed,
            rows_written = report.metrics.rows_written,
            halted = report.metrics.partitions_halted,
            "pipeline shutdown complete"
        );
        Ok(report)
    }
}

async fn run_reporter(
    metrics: Arc<PipelineMetrics>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = metrics.snapshot();
                info!(
                    accepted = snapshot.events_accepted,
                    appended = snapshot.events_appended,
                    written = snapshot.rows_written,
                    duplicates = snapshot.duplicates_absorbed,
                    poison = snapshot.poison_records,
                    halted = snapshot.partitions_halted,
                    rows_per_sec = metrics.rows_per_second(),
                    write_p99 = ?snapshot.write.p99,
                    "pipeline stats"
                );
            }
            _ = stopped(&mut shutdown) => break,
        }
    }
}
