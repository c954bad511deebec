//! Pipeline metrics collection

use crate::event::{Offset, PartitionId};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const MAX_SAMPLES: usize = 1000;

/// Bounded window of recent durations
#[derive(Debug, Default)]
struct Samples(RwLock<VecDeque<Duration>>);

impl Samples {
    fn record(&self, duration: Duration) {
        let mut samples = self.0.write();
        if samples.len() == MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(duration);
    }

    fn stats(&self) -> ProcessingStats {
        let mut sorted: Vec<Duration> = self.0.read().iter().copied().collect();
        if sorted.is_empty() {
            return ProcessingStats::default();
        }
        sorted.sort();

        let last = sorted.len() - 1;
        let sum: Duration = sorted.iter().sum();
        ProcessingStats {
            count: sorted.len(),
            p50: sorted[sorted.len() / 2],
            p95: sorted[(last as f64 * 0.95) as usize],
            p99: sorted[(last as f64 * 0.99) as usize],
            mean: sum / sorted.len() as u32,
            sum,
            le_10ms: sorted.partition_point(|d| *d <= Duration::from_millis(10)),
            le_100ms: sorted.partition_point(|d| *d <= Duration::from_millis(100)),
            le_1s: sorted.partition_point(|d| *d <= Duration::from_secs(1)),
        }
    }

    fn clear(&self) {
        self.0.write().clear();
    }
}

/// Latency statistics over the recent sample window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProcessingStats {
    /// Samples in the window
    pub count: usize,
    /// Median
    pub p50: Duration,
    /// 95th percentile
    pub p95: Duration,
    /// 99th percentile
    pub p99: Duration,
    /// Mean
    pub mean: Duration,
    /// Sum of all samples
    pub sum: Duration,
    #[serde(skip)]
    le_10ms: usize,
    #[serde(skip)]
    le_100ms: usize,
    #[serde(skip)]
    le_1s: usize,
}

/// Counters and latency samples shared by every pipeline component
#[derive(Debug)]
pub struct PipelineMetrics {
    events_accepted: AtomicU64,
    events_rejected: AtomicU64,
    batches_flushed: AtomicU64,
    events_appended: AtomicU64,
    append_retries: AtomicU64,
    append_failures: AtomicU64,
    records_polled: AtomicU64,
    rows_written: AtomicU64,
    duplicates_absorbed: AtomicU64,
    poison_records: AtomicU64,
    checkpoints_committed: AtomicU64,
    write_retries: AtomicU64,
    checkpoint_retries: AtomicU64,
    partitions_halted: AtomicU64,
    append_durations: Samples,
    write_durations: Samples,
    commit_durations: Samples,
    error_counts: RwLock<HashMap<&'static str, u64>>,
    committed_offsets: RwLock<BTreeMap<PartitionId, Offset>>,
    start_time: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($(#[$doc:meta] $inc:ident => $field:ident),* $(,)?) => {
        $(
            #[$doc]
            pub fn $inc(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl PipelineMetrics {
    /// Create a zeroed collector
    pub fn new() -> Self {
        Self {
            events_accepted: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            events_appended: AtomicU64::new(0),
            append_retries: AtomicU64::new(0),
            append_failures: AtomicU64::new(0),
            records_polled: AtomicU64::new(0),
            rows_written: AtomicU64::new(0),
            duplicates_absorbed: AtomicU64::new(0),
            poison_records: AtomicU64::new(0),
            checkpoints_committed: AtomicU64::new(0),
            write_retries: AtomicU64::new(0),
            checkpoint_retries: AtomicU64::new(0),
            partitions_halted: AtomicU64::new(0),
            append_durations: Samples::default(),
            write_durations: Samples::default(),
            commit_durations: Samples::default(),
            error_counts: RwLock::new(HashMap::new()),
            committed_offsets: RwLock::new(BTreeMap::new()),
            start_time: Instant::now(),
        }
    }

    counter! {
        /// Events accepted by the buffer
        add_accepted => events_accepted,
        /// Events refused at enqueue
        add_rejected => events_rejected,
        /// Batches drained by the flusher
        add_batches_flushed => batches_flushed,
        /// Events acknowledged by the log
        add_appended => events_appended,
        /// Append retries
        add_append_retries => append_retries,
        /// Events lost to append exhaustion
        add_append_failures => append_failures,
        /// Records read from the log
        add_polled => records_polled,
        /// Rows newly written to the sink
        add_written => rows_written,
        /// Duplicate writes absorbed
        add_duplicates => duplicates_absorbed,
        /// Records skipped as poison
        add_poison => poison_records,
        /// Sink write retries
        add_write_retries => write_retries,
        /// Checkpoint retries
        add_checkpoint_retries => checkpoint_retries,
    }

    /// Record a committed checkpoint
    pub fn record_checkpoint(&self, partition: PartitionId, offset: Offset, duration: Duration) {
        self.checkpoints_committed.fetch_add(1, Ordering::Relaxed);
        self.committed_offsets.write().insert(partition, offset);
        self.commit_durations.record(duration);
    }

    /// Seed the committed offset loaded at startup
    pub fn set_committed_offset(&self, partition: PartitionId, offset: Offset) {
        self.committed_offsets.write().insert(partition, offset);
    }

    /// Record a halted consumer
    pub fn record_halt(&self) {
        self.partitions_halted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record log append latency
    pub fn record_append_duration(&self, duration: Duration) {
        self.append_durations.record(duration);
    }

    /// Record sink write latency
    pub fn record_write_duration(&self, duration: Duration) {
        self.write_durations.record(duration);
    }

    /// Count an error by kind
    pub fn record_error(&self, kind: &'static str) {
        *self.error_counts.write().entry(kind).or_insert(0) += 1;
    }

    /// Rows newly written so far
    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    /// Events acknowledged by the log so far
    pub fn events_appended(&self) -> u64 {
        self.events_appended.load(Ordering::Relaxed)
    }

    /// Records skipped as poison so far
    pub fn poison_records(&self) -> u64 {
        self.poison_records.load(Ordering::Relaxed)
    }

    /// Last committed offset per partition
    pub fn committed_offset(&self, partition: PartitionId) -> Option<Offset> {
        self.committed_offsets.read().get(&partition).copied()
    }

    /// Append latency statistics
    pub fn append_stats(&self) -> ProcessingStats {
        self.append_durations.stats()
    }

    /// Sink write latency statistics
    pub fn write_stats(&self) -> ProcessingStats {
        self.write_durations.stats()
    }

    /// Checkpoint latency statistics
    pub fn commit_stats(&self) -> ProcessingStats {
        self.commit_durations.stats()
    }

    /// Rows written per second since start
    pub fn rows_per_second(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.rows_written() as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs_f64(),
            events_accepted: load(&self.events_accepted),
            events_rejected: load(&self.events_rejected),
            batches_flushed: load(&self.batches_flushed),
            events_appended: load(&self.events_appended),
            append_retries: load(&self.append_retries),
            append_failures: load(&self.append_failures),
            records_polled: load(&self.records_polled),
            rows_written: load(&self.rows_written),
            duplicates_absorbed: load(&self.duplicates_absorbed),
            poison_records: load(&self.poison_records),
            checkpoints_committed: load(&self.checkpoints_committed),
            write_retries: load(&self.write_retries),
            checkpoint_retries: load(&self.checkpoint_retries),
            partitions_halted: load(&self.partitions_halted),
            errors: self
                .error_counts
                .read()
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            committed_offsets: self.committed_offsets.read().clone(),
            append: self.append_stats(),
            write: self.write_stats(),
            commit: self.commit_stats(),
        }
    }

    /// Reset all counters and samples
    pub fn reset(&self) {
        for counter in [
            &self.events_accepted,
            &self.events_rejected,
            &self.batches_flushed,
            &self.events_appended,
            &self.append_retries,
            &self.append_failures,
            &self.records_polled,
            &self.rows_written,
            &self.duplicates_absorbed,
            &self.poison_records,
            &self.checkpoints_committed,
            &self.write_retries,
            &self.checkpoint_retries,
            &self.partitions_halted,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.append_durations.clear();
        self.write_durations.clear();
        self.commit_durations.clear();
        self.error_counts.write().clear();
        self.committed_offsets.write().clear();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        let _ = write!(
            out,
            "# HELP logpipe_events_total Events by pipeline stage\n\
             # TYPE logpipe_events_total counter\n\
             logpipe_events_total{{stage=\"accepted\"}} {}\n\
             logpipe_events_total{{stage=\"rejected\"}} {}\n\
             logpipe_events_total{{stage=\"appended\"}} {}\n\
             logpipe_events_total{{stage=\"append_failed\"}} {}\n\
             logpipe_events_total{{stage=\"polled\"}} {}\n\
             logpipe_events_total{{stage=\"written\"}} {}\n\
             logpipe_events_total{{stage=\"duplicate\"}} {}\n\
             logpipe_events_total{{stage=\"poison\"}} {}\n",
            s.events_accepted,
            s.events_rejected,
            s.events_appended,
            s.append_failures,
            s.records_polled,
            s.rows_written,
            s.duplicates_absorbed,
            s.poison_records,
        );

        let _ = write!(
            out,
            "# HELP logpipe_retries_total Retries by operation\n\
             # TYPE logpipe_retries_total counter\n\
             logpipe_retries_total{{operation=\"append\"}} {}\n\
             logpipe_retries_total{{operation=\"write\"}} {}\n\
             logpipe_retries_total{{operation=\"checkpoint\"}} {}\n",
            s.append_retries, s.write_retries, s.checkpoint_retries,
        );

        let _ = write!(
            out,
            "# HELP logpipe_batches_flushed_total Batches drained from the buffer\n\
             # TYPE logpipe_batches_flushed_total counter\n\
             logpipe_batches_flushed_total {}\n\
             # HELP logpipe_checkpoints_total Checkpoints committed\n\
             # TYPE logpipe_checkpoints_total counter\n\
             logpipe_checkpoints_total {}\n\
             # HELP logpipe_partitions_halted Consumers halted after retry exhaustion\n\
             # TYPE logpipe_partitions_halted gauge\n\
             logpipe_partitions_halted {}\n",
            s.batches_flushed, s.checkpoints_committed, s.partitions_halted,
        );

        if !s.committed_offsets.is_empty() {
            out.push_str("# HELP logpipe_committed_offset Last committed offset per partition\n");
            out.push_str("# TYPE logpipe_committed_offset gauge\n");
            for (partition, offset) in &s.committed_offsets {
                let _ = writeln!(
                    out,
                    "logpipe_committed_offset{{partition=\"{}\"}} {}",
                    partition, offset
                );
            }
        }

        if !s.errors.is_empty() {
            out.push_str("# HELP logpipe_errors_total Errors by kind\n");
            out.push_str("# TYPE logpipe_errors_total counter\n");
            for (kind, count) in &s.errors {
                let _ = writeln!(out, "logpipe_errors_total{{kind=\"{}\"}} {}", kind, count);
            }
        }

        for (name, help, stats) in [
            ("append", "Log append duration", &s.append),
            ("write", "Sink write duration", &s.write),
            ("commit", "Checkpoint commit duration", &s.commit),
        ] {
            if stats.count == 0 {
                continue;
            }
            let _ = write!(
                out,
                "# HELP logpipe_{name}_duration_seconds {help}\n\
                 # TYPE logpipe_{name}_duration_seconds histogram\n\
                 logpipe_{name}_duration_seconds_bucket{{le=\"0.01\"}} {}\n\
                 logpipe_{name}_duration_seconds_bucket{{le=\"0.1\"}} {}\n\
                 logpipe_{name}_duration_seconds_bucket{{le=\"1.0\"}} {}\n\
                 logpipe_{name}_duration_seconds_bucket{{le=\"+Inf\"}} {}\n\
                 logpipe_{name}_duration_seconds_sum {}\n\
                 logpipe_{name}_duration_seconds_count {}\n",
                stats.le_10ms,
                stats.le_100ms,
                stats.le_1s,
                stats.count,
                stats.sum.as_secs_f64(),
                stats.count,
                name = name,
                help = help,
            );
        }

        out
    }
}

/// Serializable copy of [`PipelineMetrics`]
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Seconds since the collector was created
    pub uptime_secs: f64,
    /// Events accepted by the buffer
    pub events_accepted: u64,
    /// Events refused at enqueue
    pub events_rejected: u64,
    /// Batches drained by the flusher
    pub batches_flushed: u64,
    /// Events acknowledged by the log
    pub events_appended: u64,
    /// Append retries
    pub append_retries: u64,
    /// Events lost to append exhaustion
    pub append_failures: u64,
    /// Records read from the log
    pub records_polled: u64,
    /// Rows newly written
    pub rows_written: u64,
    /// Duplicate writes absorbed
    pub duplicates_absorbed: u64,
    /// Records skipped as poison
    pub poison_records: u64,
    /// Checkpoints committed
    pub checkpoints_committed: u64,
    /// Sink write retries
    pub write_retries: u64,
    /// Checkpoint retries
    pub checkpoint_retries: u64,
    /// Halted consumers
    pub partitions_halted: u64,
    /// Errors by kind
    pub errors: BTreeMap<String, u64>,
    /// Last committed offset per partition
    pub committed_offsets: BTreeMap<PartitionId, Offset>,
    /// Append latency
    pub append: ProcessingStats,
    /// Write latency
    pub write: ProcessingStats,
    /// Commit latency
    pub commit: ProcessingStats,
}
