//! Partitioned append-only log interface and in-memory backend

use crate::error::{IngestError, IngestResult};
use crate::event::{Event, Offset, PartitionId, PartitionRecord};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

/// Acknowledgement for a successful append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendAck {
    /// Partition appended to
    pub partition: PartitionId,
    /// Offset assigned to the first event
    pub first_offset: Offset,
    /// Offset assigned to the last event
    pub last_offset: Offset,
}

/// A partitioned, append-only, replicated log
///
/// Each partition is a strictly ordered sequence of records with offsets
/// assigned contiguously by the log.
#[async_trait]
pub trait PartitionedLog: Send + Sync + 'static {
    /// Number of partitions, fixed for the lifetime of the log
    fn partition_count(&self) -> u32;

    /// Append events in order to one partition
    async fn append(&self, partition: PartitionId, events: Vec<Event>) -> IngestResult<AppendAck>;

    /// Read up to `max_records` records starting at `from`
    async fn read(
        &self,
        partition: PartitionId,
        from: Offset,
        max_records: usize,
    ) -> IngestResult<Vec<PartitionRecord>>;

    /// Offset the next appended record will receive
    async fn end_offset(&self, partition: PartitionId) -> IngestResult<Offset>;
}

/// In-memory log, one ordered vector per partition
#[derive(Debug)]
pub struct MemoryLog {
    partitions: Vec<RwLock<Vec<PartitionRecord>>>,
}

impl MemoryLog {
    /// Create a log with `partition_count` empty partitions
    pub fn new(partition_count: u32) -> Self {
        Self {
            partitions: (0..partition_count).map(|_| RwLock::new(Vec::new())).collect(),
        }
    }

    fn partition(&self, partition: PartitionId) -> IngestResult<&RwLock<Vec<PartitionRecord>>> {
        self.partitions
            .get(partition as usize)
            .ok_or(IngestError::InvalidPartition {
                partition,
                count: self.partitions.len() as u32,
            })
    }

    /// Records currently held by a partition
    pub fn len(&self, partition: PartitionId) -> usize {
        self.partitions
            .get(partition as usize)
            .map(|p| p.read().len())
            .unwrap_or(0)
    }

    /// Records held across all partitions
    pub fn total_len(&self) -> usize {
        self.partitions.iter().map(|p| p.read().len()).sum()
    }

    /// Every record of a partition, in offset order
    pub fn snapshot(&self, partition: PartitionId) -> Vec<PartitionRecord> {
        self.partitions
            .get(partition as usize)
            .map(|p| p.read().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PartitionedLog for MemoryLog {
    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn append(&self, partition: PartitionId, events: Vec<Event>) -> IngestResult<AppendAck> {
        if events.is_empty() {
            return Err(IngestError::LogAppend("empty append".to_string()));
        }

        let mut records = self.partition(partition)?.write();
        let first_offset = records.len() as Offset;
        let appended_at = Utc::now();

        records.extend(events.into_iter().enumerate().map(|(i, event)| PartitionRecord {
            partition,
            offset: first_offset + i as Offset,
            appended_at,
            event,
        }));

        Ok(AppendAck {
            partition,
            first_offset,
            last_offset: records.len() as Offset - 1,
        })
    }

    async fn read(
        &self,
        partition: PartitionId,
        from: Offset,
        max_records: usize,
    ) -> IngestResult<Vec<PartitionRecord>> {
        let records = self.partition(partition)?.read();
        let start = (from as usize).min(records.len());
        Ok(records[start..].iter().take(max_records).cloned().collect())
    }

    async fn end_offset(&self, partition: PartitionId) -> IngestResult<Offset> {
        Ok(self.partition(partition)?.read().len() as Offset)
    }
}
