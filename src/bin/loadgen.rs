//! Load generator for the ingestion pipeline
//!
//! Pushes synthetic log events through a pipeline backed by the in-memory
//! log and sink, waits for every event to reach the sink and prints the final
//! metrics as JSON.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use logpipe::{
    init_tracing, CheckpointStore, Event, FileCheckpointStore, LogPayload, MemoryCheckpointStore,
    MemoryLog, MemorySink, Pipeline, PipelineConfig, Rejection, RoutingPolicy,
};
use rand::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const SOURCES: &[&str] = &["auth", "api", "checkout", "billing", "search", "scheduler"];
const LEVELS: &[&str] = &["trace", "debug", "info", "info", "info", "warn", "error"];
const MESSAGES: &[&str] = &[
    "request completed",
    "cache miss",
    "upstream timeout",
    "login throttled",
    "payment declined",
    "job rescheduled",
    "connection reset by peer",
];

/// Synthetic load for the log ingestion pipeline
#[derive(Parser, Debug)]
#[command(name = "logpipe-loadgen")]
#[command(version = logpipe::VERSION)]
#[command(about = "Drive synthetic log events through the ingestion pipeline", long_about = None)]
struct Cli {
    /// Events to generate
    #[arg(short = 'n', long, default_value_t = 100_000)]
    events: u64,

    /// Log partitions
    #[arg(short, long, default_value_t = 8)]
    partitions: u32,

    /// Partition routing policy
    #[arg(long, value_enum, default_value = "key-hash")]
    routing: Routing,

    /// Distinct routing keys (0 sends keyless events)
    #[arg(long, default_value_t = 64)]
    keys: usize,

    /// Events per producer batch
    #[arg(long, default_value_t = 100)]
    producer_batch: usize,

    /// Buffer flush batch size
    #[arg(long, default_value_t = 500)]
    batch_size: usize,

    /// Sink write batch size
    #[arg(long, default_value_t = 1000)]
    write_batch_size: usize,

    /// Partitions allowed to write at once
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Optional YAML configuration; command-line flags override it
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Persist checkpoints under this directory instead of in memory
    #[arg(long, value_name = "DIR")]
    checkpoint_dir: Option<PathBuf>,

    /// Give up waiting for the sink after this many seconds
    #[arg(long, default_value_t = 120)]
    drain_timeout: u64,

    /// Show a progress bar
    #[arg(long)]
    progress: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Routing {
    KeyHash,
    RoundRobin,
}

impl From<Routing> for RoutingPolicy {
    fn from(routing: Routing) -> Self {
        match routing {
            Routing::KeyHash => RoutingPolicy::KeyHash,
            Routing::RoundRobin => RoutingPolicy::RoundRobin,
        }
    }
}

fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    config.partition_count = cli.partitions;
    config.routing_policy = cli.routing.into();
    config.batch_size = cli.batch_size;
    config.write_batch_size = cli.write_batch_size;
    config.prefetch = config.prefetch.max(cli.write_batch_size);
    if let Some(concurrency) = cli.concurrency {
        config.max_concurrent_partitions = concurrency;
    }
    config.validate()?;
    Ok(config)
}

fn random_event(rng: &mut impl Rng, keys: usize) -> Event {
    let source = SOURCES.choose(rng).copied().unwrap_or("api");
    let level = LEVELS.choose(rng).copied().unwrap_or("info");
    let message = MESSAGES.choose(rng).copied().unwrap_or("request completed");

    let payload = LogPayload::new(source, level, message)
        .with_field("latency_ms", serde_json::json!(rng.gen_range(1..2_000)))
        .with_field("status", serde_json::json!(rng.gen_range(200..600)));

    let event = Event::new(payload);
    if keys == 0 {
        event
    } else {
        event.routing_key(format!("tenant-{}", rng.gen_range(0..keys)))
    }
}

fn progress_bar(len: u64, enabled: bool) -> Option<ProgressBar> {
    if !enabled {
        return None;
    }
    let pb = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    Some(pb)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    let checkpoints: Arc<dyn CheckpointStore> = match &cli.checkpoint_dir {
        Some(dir) => Arc::new(
            FileCheckpointStore::open(dir)
                .await
                .with_context(|| format!("Failed to open checkpoint directory {}", dir.display()))?,
        ),
        None => Arc::new(MemoryCheckpointStore::new()),
    };
    let log = Arc::new(MemoryLog::new(config.partition_count));
    let sink = Arc::new(MemorySink::new());

    let pipeline = Pipeline::start(config, log.clone(), sink.clone(), checkpoints)
        .context("Failed to start pipeline")?;
    let metrics = pipeline.metrics().clone();

    info!(events = cli.events, partitions = cli.partitions, "load generation started");
    let started = Instant::now();
    let progress = progress_bar(cli.events, cli.progress);

    let mut rng = rand::thread_rng();
    let mut sent = 0u64;
    let mut full_retries = 0u64;
    while sent < cli.events {
        let take = (cli.events - sent).min(cli.producer_batch.max(1) as u64);
        let batch: Vec<Event> = (0..take).map(|_| random_event(&mut rng, cli.keys)).collect();

        loop {
            match pipeline.enqueue_batch(batch.clone()) {
                Ok(_) => break,
                Err(Rejection::BufferFull { .. }) => {
                    full_retries += 1;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Err(rejection) => bail!("enqueue refused: {}", rejection),
            }
        }

        sent += take;
        if let Some(pb) = &progress {
            pb.inc(take);
        }
    }
    if let Some(pb) = &progress {
        pb.finish_with_message("enqueued");
    }

    let deadline = Instant::now() + Duration::from_secs(cli.drain_timeout);
    while metrics.rows_written() + metrics.poison_records() < cli.events {
        if Instant::now() >= deadline {
            warn!(
                written = metrics.rows_written(),
                expected = cli.events,
                "sink did not catch up before the drain timeout"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let report = pipeline.shutdown().await.context("Shutdown failed")?;
    let elapsed = started.elapsed();
    info!(
        elapsed = ?elapsed,
        buffer_full_retries = full_retries,
        log_records = log.total_len(),
        sink_rows = sink.len(),
        events_per_sec = cli.events as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        "load generation finished"
    );

    println!("{}", serde_json::to_string_pretty(&report.metrics)?);

    if report.has_halted() {
        bail!("one or more partition consumers halted");
    }
    Ok(())
}
