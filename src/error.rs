//! Error types for the ingestion pipeline

use crate::event::{Offset, PartitionId};
use std::io;
use thiserror::Error;

/// Result type for pipeline operations
pub type IngestResult<T> = Result<T, IngestError>;

/// Pipeline error types
#[derive(Error, Debug)]
pub enum IngestError {
    /// Configuration errors, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Event has no routing key under strict key-hash routing
    #[error("Event {id} has no routing key and round-robin fallback is disabled")]
    MissingRoutingKey {
        /// Event id
        id: String,
    },

    /// Partition outside the configured range
    #[error("Partition {partition} out of range (partition count {count})")]
    InvalidPartition {
        /// Requested partition
        partition: PartitionId,
        /// Configured partition count
        count: u32,
    },

    /// Log append failures
    #[error("Log append error: {0}")]
    LogAppend(String),

    /// Log read failures
    #[error("Log read error: {0}")]
    LogRead(String),

    /// Sink write failures affecting the whole batch
    #[error("Sink error: {0}")]
    Sink(String),

    /// A single record the sink can never accept
    #[error("Poison record {id} at offset {offset}: {reason}")]
    PoisonRecord {
        /// Offset of the offending record
        offset: Offset,
        /// Event id of the offending record
        id: String,
        /// Why the record was refused
        reason: String,
    },

    /// Checkpoint store failures
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// External call exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Bounded retries ran out
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Operation that was retried
        operation: String,
        /// Attempts made, including the first
        attempts: u32,
        /// Final error message
        last_error: String,
    },

    /// Checkpoint would move backwards or stand still
    #[error("Checkpoint regression on partition {partition}: {previous} -> {next}")]
    CheckpointRegression {
        /// Partition
        partition: PartitionId,
        /// Previously committed offset
        previous: Offset,
        /// Rejected offset
        next: Offset,
    },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON encoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML config errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Channel errors
    #[error("Channel error: {0}")]
    Channel(String),

    /// Shutdown errors
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

impl IngestError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::LogAppend(_) => true,
            IngestError::LogRead(_) => true,
            IngestError::Sink(_) => true,
            IngestError::Checkpoint(_) => true,
            IngestError::Timeout(_) => true,
            IngestError::Io(_) => true,
            IngestError::Config(_) => false,
            IngestError::MissingRoutingKey { .. } => false,
            IngestError::InvalidPartition { .. } => false,
            IngestError::PoisonRecord { .. } => false,
            IngestError::CheckpointRegression { .. } => false,
            _ => false,
        }
    }

    /// Get error severity
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            IngestError::Config(_) => ErrorSeverity::Fatal,
            IngestError::InvalidPartition { .. } => ErrorSeverity::Fatal,
            IngestError::RetriesExhausted { .. } => ErrorSeverity::Fatal,
            IngestError::CheckpointRegression { .. } => ErrorSeverity::Fatal,
            IngestError::PoisonRecord { .. } => ErrorSeverity::Warning,
            IngestError::MissingRoutingKey { .. } => ErrorSeverity::Warning,
            IngestError::Timeout(_) => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Config(_) => "config",
            IngestError::MissingRoutingKey { .. } => "missing_routing_key",
            IngestError::InvalidPartition { .. } => "invalid_partition",
            IngestError::LogAppend(_) => "log_append",
            IngestError::LogRead(_) => "log_read",
            IngestError::Sink(_) => "sink",
            IngestError::PoisonRecord { .. } => "poison_record",
            IngestError::Checkpoint(_) => "checkpoint",
            IngestError::Timeout(_) => "timeout",
            IngestError::RetriesExhausted { .. } => "retries_exhausted",
            IngestError::CheckpointRegression { .. } => "checkpoint_regression",
            IngestError::Io(_) => "io",
            IngestError::Serialization(_) => "serialization",
            IngestError::Yaml(_) => "yaml",
            IngestError::Channel(_) => "channel",
            IngestError::Shutdown(_) => "shutdown",
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Warnings that don't stop processing
    Warning,
    /// Errors that may be retried
    Error,
    /// Fatal errors that stop a consumer or the pipeline
    Fatal,
}

/// Why the buffer refused an event
///
/// A rejection is returned synchronously from `enqueue` and never reflects
/// the outcome of the later log append.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Bounded queue has no room
    #[error("Buffer full: {depth}/{capacity} events queued")]
    BufferFull {
        /// Current depth
        depth: usize,
        /// Configured capacity
        capacity: usize,
    },

    /// Event failed validation
    #[error("Invalid event: {0}")]
    Invalid(String),

    /// Buffer has been shut down
    #[error("Buffer closed")]
    Closed,
}

/// Convert from channel send errors
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for IngestError {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        IngestError::Channel(format!("Failed to send: {}", err))
    }
}

/// Convert from channel receive errors
impl From<tokio::sync::oneshot::error::RecvError> for IngestError {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        IngestError::Channel(format!("Failed to receive: {}", err))
    }
}

/// Convert from elapsed deadlines
impl From<tokio::time::error::Elapsed> for IngestError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        IngestError::Timeout(err.to_string())
    }
}
