//! Idempotent sink interface and in-memory backend
//!
//! Writing a row whose id already exists is a no-op, never an error. This
//! is what makes redelivery after a crash harmless.

use crate::error::IngestResult;
use crate::event::{Offset, PartitionId, PartitionRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Materialized representation of an event in the sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRow {
    /// Unique event id
    pub id: String,
    /// Partition the event was read from
    pub partition: PartitionId,
    /// Offset within that partition
    pub offset: Offset,
    /// Emitting system
    pub source: String,
    /// Severity level
    pub level: String,
    /// Log message
    pub message: String,
    /// Log timestamp
    pub timestamp: DateTime<Utc>,
    /// When the row was first written
    pub written_at: DateTime<Utc>,
}

impl SinkRow {
    /// Build a row from a log record
    pub fn from_record(record: &PartitionRecord) -> Self {
        let payload = &record.event.payload;
        Self {
            id: record.event.id.clone(),
            partition: record.partition,
            offset: record.offset,
            source: payload.source.clone(),
            level: payload.level.clone(),
            message: payload.message.clone(),
            timestamp: payload.timestamp,
            written_at: Utc::now(),
        }
    }
}

/// A record the sink refused and will always refuse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    /// Offset of the record
    pub offset: Offset,
    /// Event id of the record
    pub id: String,
    /// Why it was refused
    pub reason: String,
}

/// Outcome of a batch write
///
/// Partial success is a normal outcome: `written + duplicates +
/// rejected.len()` equals the batch length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    /// Rows newly inserted
    pub written: usize,
    /// Rows absorbed because the id already existed
    pub duplicates: usize,
    /// Records refused as malformed
    pub rejected: Vec<RejectedRecord>,
}

/// Bulk-write store with a uniqueness constraint on the event id
#[async_trait]
pub trait IdempotentSink: Send + Sync + 'static {
    /// Write a batch, absorbing duplicate ids silently
    ///
    /// An `Err` means nothing in the batch can be assumed durable and the
    /// whole call may be retried.
    async fn write_batch(&self, records: &[PartitionRecord]) -> IngestResult<WriteResult>;
}

/// Column constraints applied by [`MemorySink`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkSchema {
    /// Longest message the message column holds
    pub max_message_len: usize,
    /// Whether an empty source is refused
    pub require_source: bool,
    /// Accepted levels; empty accepts any
    pub allowed_levels: Vec<String>,
}

impl Default for SinkSchema {
    fn default() -> Self {
        Self {
            max_message_len: 32 * 1024,
            require_source: true,
            allowed_levels: ["trace", "debug", "info", "warn", "error", "fatal"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl SinkSchema {
    /// Check a record against the schema
    pub fn check(&self, record: &PartitionRecord) -> Result<(), String> {
        let payload = &record.event.payload;
        if record.event.id.is_empty() {
            return Err("empty id".to_string());
        }
        if self.require_source && payload.source.trim().is_empty() {
            return Err("empty source".to_string());
        }
        if payload.message.len() > self.max_message_len {
            return Err(format!(
                "message length {} exceeds {}",
                payload.message.len(),
                self.max_message_len
            ));
        }
        if !self.allowed_levels.is_empty()
            && !self
                .allowed_levels
                .iter()
                .any(|l| l.eq_ignore_ascii_case(&payload.level))
        {
            return Err(format!("unknown level {:?}", payload.level));
        }
        Ok(())
    }
}

/// In-memory sink keyed by event id
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: DashMap<String, SinkRow>,
    schema: SinkSchema,
    write_calls: AtomicU64,
    duplicates: AtomicU64,
}

impl MemorySink {
    /// Create a sink with the default schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sink with a custom schema
    pub fn with_schema(schema: SinkSchema) -> Self {
        Self {
            schema,
            ..Self::default()
        }
    }

    /// Number of visible rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the sink holds no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row for an id
    pub fn get(&self, id: &str) -> Option<SinkRow> {
        self.rows.get(id).map(|row| row.clone())
    }

    /// Every row, in no particular order
    pub fn rows(&self) -> Vec<SinkRow> {
        self.rows.iter().map(|row| row.value().clone()).collect()
    }

    /// Number of `write_batch` calls served
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::Relaxed)
    }

    /// Total duplicate writes absorbed
    pub fn duplicates_absorbed(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl IdempotentSink for MemorySink {
    async fn write_batch(&self, records: &[PartitionRecord]) -> IngestResult<WriteResult> {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        let mut result = WriteResult::default();

        for record in records {
            if let Err(reason) = self.schema.check(record) {
                result.rejected.push(RejectedRecord {
                    offset: record.offset,
                    id: record.event.id.clone(),
                    reason,
                });
                continue;
            }

            match self.rows.entry(record.event.id.clone()) {
                Entry::Occupied(_) => result.duplicates += 1,
                Entry::Vacant(slot) => {
                    slot.insert(SinkRow::from_record(record));
                    result.written += 1;
                }
            }
        }

        self.duplicates
            .fetch_add(result.duplicates as u64, Ordering::Relaxed);
        Ok(result)
    }
}
