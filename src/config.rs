//! Pipeline configuration structures

use crate::error::{IngestError, IngestResult};
use crate::event::BatchLimits;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How the router picks a partition for an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingPolicy {
    /// Hash the routing key modulo the partition count
    KeyHash,
    /// Cycle through partitions
    RoundRobin,
}

/// Where a consumer starts when its partition has no checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    /// First record still held by the log
    Earliest,
    /// Only records appended after the consumer starts
    Latest,
}

/// Full pipeline configuration
///
/// Every field has a default, so a YAML file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of log partitions, fixed for the lifetime of a deployment
    pub partition_count: u32,

    /// Partition selection policy
    pub routing_policy: RoutingPolicy,

    /// Route keyless events round-robin under key-hash policy
    pub round_robin_fallback: bool,

    /// Consumer group owning the checkpoints
    pub consumer_group: String,

    /// Buffer flush trigger: events per batch
    pub batch_size: usize,
    /// Buffer flush trigger: bytes per batch
    pub batch_max_bytes: usize,
    /// Buffer flush trigger: age of the oldest queued event
    pub batch_timeout_ms: u64,

    /// Bounded queue capacity; enqueue is rejected beyond this
    pub buffer_capacity: usize,
    /// Largest single event accepted
    pub max_event_bytes: usize,
    /// Concurrent log appends in flight
    pub max_inflight_appends: usize,

    /// Consumer write batch: records per sink write
    pub write_batch_size: usize,
    /// Consumer write batch: bytes per sink write
    pub write_batch_max_bytes: usize,
    /// Consumer write batch: how long to wait for a batch to fill
    pub write_batch_max_wait_ms: u64,

    /// Records requested per log read
    pub prefetch: usize,
    /// Initial idle wait when a partition has no new records
    pub poll_interval_ms: u64,
    /// Ceiling for the idle backoff
    pub max_poll_backoff_ms: u64,

    /// Partitions allowed in a write/checkpoint cycle at once
    pub max_concurrent_partitions: usize,

    /// Start position for partitions without a checkpoint
    pub default_start_position: StartPosition,

    /// Deadline for a single external call
    pub operation_timeout_ms: u64,

    /// Retry policy for log appends
    pub append_retry: RetryPolicy,
    /// Retry policy for sink writes
    pub write_retry: RetryPolicy,
    /// Retry policy for checkpoint reads and writes
    pub checkpoint_retry: RetryPolicy,

    /// Report backpressure when the buffer is this fraction full
    pub pause_threshold: f64,
    /// Clear backpressure when the buffer drops to this fraction
    pub resume_threshold: f64,

    /// Metrics reporting interval
    pub metrics_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partition_count: 4,
            routing_policy: RoutingPolicy::RoundRobin,
            round_robin_fallback: true,
            consumer_group: "logpipe".to_string(),
            batch_size: 500,
            batch_max_bytes: 1024 * 1024,
            batch_timeout_ms: 100,
            buffer_capacity: 100_000,
            max_event_bytes: 256 * 1024,
            max_inflight_appends: 8,
            write_batch_size: 1000,
            write_batch_max_bytes: 4 * 1024 * 1024,
            write_batch_max_wait_ms: 200,
            prefetch: 2000,
            poll_interval_ms: 10,
            max_poll_backoff_ms: 1000,
            max_concurrent_partitions: num_cpus::get(),
            default_start_position: StartPosition::Earliest,
            operation_timeout_ms: 10_000,
            append_retry: RetryPolicy::default(),
            write_retry: RetryPolicy::default(),
            checkpoint_retry: RetryPolicy::default(),
            pause_threshold: 0.8,
            resume_threshold: 0.5,
            metrics_interval_ms: 60_000,
        }
    }
}

impl PipelineConfig {
    /// Create a new pipeline config builder
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::new()
    }

    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> IngestResult<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> IngestResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Producer-side batch ceilings
    pub fn buffer_limits(&self) -> BatchLimits {
        BatchLimits::new(self.batch_size, self.batch_max_bytes)
    }

    /// Consumer-side batch ceilings
    pub fn write_limits(&self) -> BatchLimits {
        BatchLimits::new(self.write_batch_size, self.write_batch_max_bytes)
    }

    /// Buffer flush age
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    /// Consumer batch fill deadline
    pub fn write_batch_max_wait(&self) -> Duration {
        Duration::from_millis(self.write_batch_max_wait_ms)
    }

    /// Initial idle poll wait
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Idle poll ceiling
    pub fn max_poll_backoff(&self) -> Duration {
        Duration::from_millis(self.max_poll_backoff_ms)
    }

    /// External call deadline
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Metrics reporting interval
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> IngestResult<()> {
        let fail = |msg: &str| Err(IngestError::Config(msg.to_string()));

        if self.partition_count == 0 {
            return fail("partition_count must be greater than 0");
        }
        if self.consumer_group.trim().is_empty() {
            return fail("consumer_group cannot be empty");
        }
        if self.batch_size == 0 || self.write_batch_size == 0 {
            return fail("batch sizes must be greater than 0");
        }
        if self.batch_timeout_ms == 0 {
            return fail("batch_timeout_ms must be greater than 0");
        }
        if self.buffer_capacity < self.batch_size {
            return fail("buffer_capacity must be at least batch_size");
        }
        if self.max_event_bytes == 0 || self.max_event_bytes > self.batch_max_bytes {
            return fail("max_event_bytes must be between 1 and batch_max_bytes");
        }
        if self.write_batch_max_bytes < self.max_event_bytes {
            return fail("write_batch_max_bytes must be at least max_event_bytes");
        }
        if self.max_inflight_appends == 0 {
            return fail("max_inflight_appends must be greater than 0");
        }
        if self.prefetch == 0 {
            return fail("prefetch must be greater than 0");
        }
        if self.poll_interval_ms == 0 || self.max_poll_backoff_ms < self.poll_interval_ms {
            return fail("poll_interval_ms must be > 0 and <= max_poll_backoff_ms");
        }
        if self.max_concurrent_partitions == 0 {
            return fail("max_concurrent_partitions must be greater than 0");
        }
        if self.operation_timeout_ms == 0 {
            return fail("operation_timeout_ms must be greater than 0");
        }
        if self.pause_threshold <= self.resume_threshold {
            return fail("pause_threshold must be greater than resume_threshold");
        }
        if self.pause_threshold > 1.0 || self.resume_threshold < 0.0 {
            return fail("thresholds must be between 0 and 1");
        }
        if self.metrics_interval_ms == 0 {
            return fail("metrics_interval_ms must be greater than 0");
        }
        Ok(())
    }
}

/// Builder for PipelineConfig
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    /// Create a builder seeded with defaults
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
        }
    }

    /// Set the partition count
    pub fn partition_count(mut self, count: u32) -> Self {
        self.config.partition_count = count;
        self
    }

    /// Set the routing policy
    pub fn routing_policy(mut self, policy: RoutingPolicy) -> Self {
        self.config.routing_policy = policy;
        self
    }

    /// Allow keyless events under key-hash routing
    pub fn round_robin_fallback(mut self, enable: bool) -> Self {
        self.config.round_robin_fallback = enable;
        self
    }

    /// Set the consumer group
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.config.consumer_group = group.into();
        self
    }

    /// Set the buffer flush size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the buffer batch byte ceiling
    pub fn batch_max_bytes(mut self, bytes: usize) -> Self {
        self.config.batch_max_bytes = bytes;
        self
    }

    /// Set the buffer flush age
    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        self.config.batch_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the bounded queue capacity
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.buffer_capacity = capacity;
        self
    }

    /// Set the single event size ceiling
    pub fn max_event_bytes(mut self, bytes: usize) -> Self {
        self.config.max_event_bytes = bytes;
        self
    }

    /// Set the number of concurrent appends
    pub fn max_inflight_appends(mut self, max: usize) -> Self {
        self.config.max_inflight_appends = max;
        self
    }

    /// Set the consumer write batch size
    pub fn write_batch_size(mut self, size: usize) -> Self {
        self.config.write_batch_size = size;
        self
    }

    /// Set the consumer write batch byte ceiling
    pub fn write_batch_max_bytes(mut self, bytes: usize) -> Self {
        self.config.write_batch_max_bytes = bytes;
        self
    }

    /// Set the consumer batch fill deadline
    pub fn write_batch_max_wait(mut self, wait: Duration) -> Self {
        self.config.write_batch_max_wait_ms = wait.as_millis() as u64;
        self
    }

    /// Set the read window
    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.config.prefetch = prefetch;
        self
    }

    /// Set idle polling waits
    pub fn poll_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.poll_interval_ms = initial.as_millis() as u64;
        self.config.max_poll_backoff_ms = max.as_millis() as u64;
        self
    }

    /// Set the write cycle concurrency bound
    pub fn max_concurrent_partitions(mut self, max: usize) -> Self {
        self.config.max_concurrent_partitions = max;
        self
    }

    /// Set the default start position
    pub fn default_start_position(mut self, position: StartPosition) -> Self {
        self.config.default_start_position = position;
        self
    }

    /// Set the external call deadline
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Use one retry policy for appends, writes and checkpoints
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.append_retry = policy.clone();
        self.config.write_retry = policy.clone();
        self.config.checkpoint_retry = policy;
        self
    }

    /// Set the append retry policy
    pub fn append_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.append_retry = policy;
        self
    }

    /// Set the sink write retry policy
    pub fn write_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.write_retry = policy;
        self
    }

    /// Set the checkpoint retry policy
    pub fn checkpoint_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.checkpoint_retry = policy;
        self
    }

    /// Set backpressure thresholds
    pub fn backpressure_thresholds(mut self, pause: f64, resume: f64) -> Self {
        self.config.pause_threshold = pause;
        self.config.resume_threshold = resume;
        self
    }

    /// Set the metrics reporting interval
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.config.metrics_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Build without validating
    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

impl Default for PipelineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_partitions_rejected() {
        let config = PipelineConfig::builder().partition_count(0).build();
        assert!(matches!(config.validate(), Err(IngestError::Config(_))));
    }

    #[test]
    fn test_thresholds_rejected() {
        let config = PipelineConfig::builder()
            .backpressure_thresholds(0.4, 0.6)
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_event_larger_than_batch_rejected() {
        let config = PipelineConfig::builder()
            .batch_max_bytes(1024)
            .max_event_bytes(4096)
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_partial_override() {
        let yaml = r#"
partition_count: 8
routing_policy: key-hash
round_robin_fallback: false
default_start_position: latest
batch_timeout_ms: 25
write_retry:
  max_retries: 2
"#;
        let config = PipelineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.partition_count, 8);
        assert_eq!(config.routing_policy, RoutingPolicy::KeyHash);
        assert!(!config.round_robin_fallback);
        assert_eq!(config.default_start_position, StartPosition::Latest);
        assert_eq!(config.batch_timeout(), Duration::from_millis(25));
        assert_eq!(config.write_retry.max_retries, 2);
        assert_eq!(config.append_retry, RetryPolicy::default());
        assert_eq!(config.batch_size, 500);
    }

    #[test]
    fn test_yaml_invalid_config_is_fatal() {
        let err = PipelineConfig::from_yaml_str("partition_count: 0").unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, "partition_count: 3\nconsumer_group: audit\n").unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.partition_count, 3);
        assert_eq!(config.consumer_group, "audit");
    }
}
