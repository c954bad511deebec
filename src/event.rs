//! Events, partition records and size-bounded batches

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Partition index within the log
pub type PartitionId = u32;

/// Position of a record within one partition
pub type Offset = u64;

/// Log line carried by an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    /// Emitting system or service
    pub source: String,
    /// Severity level (e.g. "info", "error")
    pub level: String,
    /// Log message
    pub message: String,
    /// When the log line was produced
    pub timestamp: DateTime<Utc>,
    /// Additional structured fields
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl LogPayload {
    /// Create a payload stamped with the current time
    pub fn new(
        source: impl Into<String>,
        level: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            level: level.into(),
            message: message.into(),
            timestamp: Utc::now(),
            fields: serde_json::Map::new(),
        }
    }

    /// Attach a structured field
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// The unit of work accepted by the ingestion buffer
///
/// `id` is the idempotency key used by the sink. Events are immutable once
/// accepted; `enqueued_at` is stamped by the buffer on acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Stable identifier, unique per logical event
    pub id: String,
    /// Key used for partition selection under key-hash routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
    /// Event body
    pub payload: LogPayload,
    /// Local wall-clock time of acceptance
    pub enqueued_at: DateTime<Utc>,
}

impl Event {
    /// Create an event with a derived (random) id
    pub fn new(payload: LogPayload) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), payload)
    }

    /// Create an event with a caller-assigned id
    pub fn with_id(id: impl Into<String>, payload: LogPayload) -> Self {
        Self {
            id: id.into(),
            routing_key: None,
            payload,
            enqueued_at: Utc::now(),
        }
    }

    /// Set the routing key
    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    /// Size of the JSON encoding, used for every byte ceiling
    pub fn serialized_size(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(usize::MAX)
    }
}

/// An event once appended to a partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionRecord {
    /// Partition the record lives in
    pub partition: PartitionId,
    /// Log-assigned offset, contiguous per partition
    pub offset: Offset,
    /// When the log accepted the record
    pub appended_at: DateTime<Utc>,
    /// The appended event
    pub event: Event,
}

impl PartitionRecord {
    /// Event id of the record
    pub fn id(&self) -> &str {
        &self.event.id
    }
}

/// Anything that can be placed into a size-bounded batch
pub trait Measured {
    /// Encoded size in bytes
    fn size_bytes(&self) -> usize;
}

impl Measured for Event {
    fn size_bytes(&self) -> usize {
        self.serialized_size()
    }
}

impl Measured for PartitionRecord {
    fn size_bytes(&self) -> usize {
        self.event.serialized_size()
    }
}

/// Count and byte ceilings for a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    /// Maximum number of items
    pub max_count: usize,
    /// Maximum total encoded size
    pub max_bytes: usize,
}

impl BatchLimits {
    /// Create limits
    pub fn new(max_count: usize, max_bytes: usize) -> Self {
        Self {
            max_count,
            max_bytes,
        }
    }
}

/// Outcome of offering an item to a [`BatchBuilder`]
#[derive(Debug)]
pub enum Push<T> {
    /// Item was added
    Added,
    /// Batch is closed; the item was not added
    Full(T),
    /// Item can never fit within the byte ceiling
    Oversized(T),
}

/// Assembles a batch that closes at whichever ceiling is reached first
#[derive(Debug)]
pub struct BatchBuilder<T> {
    limits: BatchLimits,
    items: Vec<T>,
    bytes: usize,
}

impl<T> BatchBuilder<T> {
    /// Create an empty builder
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            items: Vec::with_capacity(limits.max_count.min(1024)),
            bytes: 0,
        }
    }

    /// Offer an item of known size
    pub fn push_sized(&mut self, item: T, size: usize) -> Push<T> {
        if size > self.limits.max_bytes {
            return Push::Oversized(item);
        }
        if self.items.len() >= self.limits.max_count
            || self.bytes.saturating_add(size) > self.limits.max_bytes
        {
            return Push::Full(item);
        }
        self.bytes += size;
        self.items.push(item);
        Push::Added
    }

    /// Whether the count ceiling has been reached
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.limits.max_count
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no items were added
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total bytes of the added items
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Close the batch
    pub fn finish(self) -> Vec<T> {
        self.items
    }
}

impl<T: Measured> BatchBuilder<T> {
    /// Offer an item, measuring its size
    pub fn push(&mut self, item: T) -> Push<T> {
        let size = item.size_bytes();
        self.push_sized(item, size)
    }
}
