//! Partitioned log ingestion with at-least-once delivery
//!
//! Producers hand events to a bounded [`IngestionBuffer`](buffer::IngestionBuffer),
//! which batches them and appends each batch to a [`PartitionedLog`]. One
//! consumer per partition reads the log in order, writes batches to an
//! [`IdempotentSink`] and then records a checkpoint. A consumer that crashes
//! between the write and the checkpoint replays the batch on restart; the
//! sink absorbs the duplicates.
//!
//! # Example
//!
//! ```no_run
//! use logpipe::{Event, LogPayload, MemoryCheckpointStore, MemoryLog, MemorySink};
//! use logpipe::{Pipeline, PipelineConfig, RoutingPolicy};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! logpipe::init_tracing();
//!
//! let config = PipelineConfig::builder()
//!     .partition_count(8)
//!     .routing_policy(RoutingPolicy::KeyHash)
//!     .build();
//!
//! let sink = Arc::new(MemorySink::new());
//! let pipeline = Pipeline::start(
//!     config,
//!     Arc::new(MemoryLog::new(8)),
//!     sink.clone(),
//!     Arc::new(MemoryCheckpointStore::new()),
//! )?;
//!
//! let event = Event::new(LogPayload::new("auth", "warn", "login throttled"))
//!     .routing_key("tenant-17");
//! pipeline.enqueue(event)?;
//!
//! let report = pipeline.shutdown().await?;
//! println!("{:?}", report.metrics);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::module_inception)]

/// Events, partition records and batches
pub mod event;

/// Error types
pub mod error;

/// Pipeline configuration
pub mod config;

/// Retry policies with exponential backoff
pub mod retry;

/// Partition selection
pub mod router;

/// Partitioned log interface
pub mod log;

/// Idempotent sink interface
pub mod sink;

/// Consumer checkpoint storage
pub mod checkpoint;

/// Ingestion buffer and flush task
pub mod buffer;

/// Partition consumers
pub mod consumer;

/// Metrics collection
pub mod metrics;

/// Shutdown signalling
pub mod shutdown;

/// End-to-end pipeline
pub mod pipeline;

pub use buffer::{Accepted, BufferStatus, Delivered, DeliveryReceipt, IngestionBuffer};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::{PipelineConfig, RoutingPolicy, StartPosition};
pub use consumer::{ConsumerPool, ConsumerState, PartitionConsumer, PartitionReport};
pub use error::{ErrorSeverity, IngestError, IngestResult, Rejection};
pub use event::{Event, LogPayload, Offset, PartitionId, PartitionRecord};
pub use log::{AppendAck, MemoryLog, PartitionedLog};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{Pipeline, PipelineStatus, ShutdownReport};
pub use retry::RetryPolicy;
pub use router::EventRouter;
pub use sink::{IdempotentSink, MemorySink, SinkRow, WriteResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the tracing subscriber with default settings
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
