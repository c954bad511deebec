//! One consumer task per partition

use crate::checkpoint::CheckpointStore;
use crate::config::PipelineConfig;
use crate::consumer::consumer::{
    ConsumerSettings, ConsumerState, PartitionConsumer, PartitionReport,
};
use crate::error::{IngestError, IngestResult};
use crate::event::{Offset, PartitionId};
use crate::log::PartitionedLog;
use crate::metrics::PipelineMetrics;
use crate::shutdown::ShutdownSignal;
use crate::sink::IdempotentSink;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Current state of one partition's consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionStatus {
    /// Partition
    pub partition: PartitionId,
    /// Consumer state
    pub state: ConsumerState,
    /// Last committed offset
    pub committed_offset: Option<Offset>,
}

struct Worker {
    partition: PartitionId,
    state: watch::Receiver<ConsumerState>,
}

/// Fixed set of partition consumers sharing a sink and checkpoint store
pub struct ConsumerPool {
    workers: Vec<Worker>,
    tasks: Mutex<Vec<(PartitionId, JoinHandle<PartitionReport>)>>,
    write_slots: Arc<Semaphore>,
    metrics: Arc<PipelineMetrics>,
    shutdown: ShutdownSignal,
}

impl ConsumerPool {
    /// Spawn a consumer for every partition of `log`
    pub fn start(
        config: &PipelineConfig,
        log: Arc<dyn PartitionedLog>,
        sink: Arc<dyn IdempotentSink>,
        checkpoints: Arc<dyn CheckpointStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> IngestResult<Self> {
        if config.max_concurrent_partitions == 0 {
            return Err(IngestError::Config(
                "max_concurrent_partitions must be greater than 0".to_string(),
            ));
        }

        let settings = ConsumerSettings::from_config(config);
        let write_slots = Arc::new(Semaphore::new(config.max_concurrent_partitions));
        let shutdown = ShutdownSignal::new("consumer pool");

        let partitions = log.partition_count();
        let mut workers = Vec::with_capacity(partitions as usize);
        let mut tasks = Vec::with_capacity(partitions as usize);

        for partition in 0..partitions {
            let consumer = PartitionConsumer::new(
                partition,
                settings.clone(),
                log.clone(),
                sink.clone(),
                checkpoints.clone(),
                metrics.clone(),
                shutdown.subscribe(),
            )
            .with_write_slots(write_slots.clone());

            workers.push(Worker {
                partition,
                state: consumer.state(),
            });

            let metrics = metrics.clone();
            let task = tokio::spawn(async move {
                let report = consumer.run().await;
                if report.state == ConsumerState::Halted {
                    metrics.record_halt();
                }
                report
            });
            tasks.push((partition, task));
        }

        info!(
            partitions,
            group = %settings.group,
            max_concurrent = config.max_concurrent_partitions,
            "consumer pool started"
        );

        Ok(Self {
            workers,
            tasks: Mutex::new(tasks),
            write_slots,
            metrics,
            shutdown,
        })
    }

    /// State of every partition's consumer
    pub fn statuses(&self) -> Vec<PartitionStatus> {
        self.workers
            .iter()
            .map(|worker| PartitionStatus {
                partition: worker.partition,
                state: *worker.state.borrow(),
                committed_offset: self.metrics.committed_offset(worker.partition),
            })
            .collect()
    }

    /// Partitions whose consumer halted
    pub fn halted(&self) -> Vec<PartitionId> {
        self.workers
            .iter()
            .filter(|worker| *worker.state.borrow() == ConsumerState::Halted)
            .map(|worker| worker.partition)
            .collect()
    }

    /// Write/checkpoint cycles that may start right now
    pub fn available_write_slots(&self) -> usize {
        self.write_slots.available_permits()
    }

    /// Stop every consumer after its in-flight write/checkpoint pair
    pub async fn shutdown(&self) -> Vec<PartitionReport> {
        self.shutdown.trigger();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let (partitions, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        let results = join_all(handles).await;

        let mut reports = Vec::with_capacity(results.len());
        for (partition, result) in partitions.into_iter().zip(results) {
            let report = match result {
                Ok(report) => report,
                Err(e) => {
                    error!(partition, error = %e, "consumer task failed");
                    self.metrics.record_halt();
                    PartitionReport {
                        partition,
                        state: ConsumerState::Halted,
                        committed_offset: self.metrics.committed_offset(partition),
                        error: Some(e.to_string()),
                    }
                }
            };
            if report.state == ConsumerState::Halted {
                warn!(partition, error = ?report.error, "partition halted before shutdown");
            }
            reports.push(report);
        }

        info!(partitions = reports.len(), "consumer pool stopped");
        reports
    }
}
