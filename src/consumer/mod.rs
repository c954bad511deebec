//! Partition consumers moving records from the log into the sink
//!
//! Each partition gets one [`PartitionConsumer`] running a small state
//! machine:
//!
//! ```text
//! Initializing -> Polling -> Batching -> Writing -> Checkpointing -> Polling
//!                    |                                                  ...
//!                    +-> Stopping -> Stopped          (any) -> Halted
//! ```
//!
//! A checkpoint is only committed for a batch the sink accepted, so a crash
//! at any point replays at most the last uncommitted batch. The sink absorbs
//! the replay.
//!
//! # Example
//!
//! ```no_run
//! use logpipe::checkpoint::MemoryCheckpointStore;
//! use logpipe::config::PipelineConfig;
//! use logpipe::consumer::ConsumerPool;
//! use logpipe::log::MemoryLog;
//! use logpipe::metrics::PipelineMetrics;
//! use logpipe::sink::MemorySink;
//! use std::sync::Arc;
//!
//! # async fn example() -> logpipe::IngestResult<()> {
//! let config = PipelineConfig::builder().partition_count(4).build();
//! let pool = ConsumerPool::start(
//!     &config,
//!     Arc::new(MemoryLog::new(4)),
//!     Arc::new(MemorySink::new()),
//!     Arc::new(MemoryCheckpointStore::new()),
//!     Arc::new(PipelineMetrics::new()),
//! )?;
//!
//! for status in pool.statuses() {
//!     println!("partition {} is {}", status.partition, status.state);
//! }
//!
//! let reports = pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod consumer;
pub mod pool;

pub use consumer::{
    ConsumerSettings, ConsumerState, PartitionConsumer, PartitionReport, SunkBatch,
};
pub use pool::{ConsumerPool, PartitionStatus};
