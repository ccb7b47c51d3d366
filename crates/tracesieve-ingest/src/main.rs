//! Tracesieve ingestion daemon.
//!
//! Reads a directory of JSONL trace files on a fixed interval and delivers
//! every new event exactly once to each configured sink.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (or TRACESIEVE_* environment variables)
//! tracesieve-ingest
//!
//! # Run with custom paths and a summary filter
//! tracesieve-ingest \
//!     --input /var/log/traces \
//!     --output-dir /data/artifacts \
//!     --bookmark-dir /data/bookmarks \
//!     --sink both \
//!     --filter _summary_
//! ```
//!
//! # Graceful Shutdown
//!
//! The daemon handles SIGINT (Ctrl+C) and SIGTERM for graceful shutdown:
//! 1. Sets the stopping flag so running passes end after the current event
//! 2. Cancels every pending pass timer
//! 3. Waits for in-flight passes to finish their segment
//! 4. Exits cleanly

use anyhow::{Context, Result};
use clap::Parser;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracesieve_core::metrics::{init_metrics, start_metrics_server};
use tracesieve_ingest::compression::detect_compression_support;
use tracesieve_ingest::sink::ConsumerControl;
use tracesieve_ingest::{
    AgentConfig, ArtifactTracker, BookmarkTracker, BufferedCacheSink, CacheConfig, CacheDelivery,
    CsvFileSink, EventBatcher, EventSink, FilterAliases, FilterHandle, FilterRegistry,
    InclusionFilter, JsonlConfig, JsonlSegmentSource, PassControl, ResumeKind,
    ResumptionTracker, SealedArtifact, SegmentSource, SinkConfig, SinkKind, ThreadScheduler,
    schedule_recurring,
};
use tracing_subscriber::EnvFilter;

/// Registry key of the daemon's filter.
const APP_ID: &str = "tracesieve-ingest";

/// Tracesieve ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "tracesieve-ingest")]
#[command(about = "Idempotent trace event ingestion daemon")]
#[command(version)]
struct Args {
    /// Directory of JSONL trace files
    #[arg(long, short)]
    input: Option<PathBuf>,

    /// Output directory for CSV artifacts
    #[arg(long, short)]
    output_dir: Option<PathBuf>,

    /// Directory for bookmark records
    #[arg(long)]
    bookmark_dir: Option<PathBuf>,

    /// Directory for buffered cache files
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Sinks to feed
    #[arg(long, value_enum)]
    sink: Option<SinkKind>,

    /// Watermark backend for the CSV sink
    #[arg(long, value_enum)]
    resume: Option<ResumeKind>,

    /// Filter rules, e.g. "*.*:2,Hosting.*:4" or "_summary_"
    #[arg(long)]
    filter: Option<String>,

    /// Seconds between passes
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Disable gzip compression of CSV artifacts
    #[arg(long)]
    no_compress: bool,
}

impl Args {
    /// Override the environment configuration with the given arguments.
    fn apply(self, config: &mut AgentConfig) {
        if let Some(input) = self.input {
            config.input_dir = input;
        }
        if let Some(output_dir) = self.output_dir {
            config.output_dir = output_dir;
        }
        if let Some(bookmark_dir) = self.bookmark_dir {
            config.bookmark_dir = bookmark_dir;
        }
        if let Some(cache_dir) = self.cache_dir {
            config.cache_dir = cache_dir;
        }
        if let Some(sink) = self.sink {
            config.sink = sink;
        }
        if let Some(resume) = self.resume {
            config.resume = resume;
        }
        if let Some(filter) = self.filter {
            config.filter = filter;
        }
        if let Some(secs) = self.interval_secs {
            config.interval = Duration::from_secs(secs.max(1));
        }
        if let Some(port) = self.metrics_port {
            config.metrics_port = port;
        }
        if self.no_compress {
            config.compress = false;
        }
    }
}

/// Counters accumulated over every pass, for the shutdown summary.
#[derive(Debug, Default)]
struct RunTotals {
    passes: usize,
    passes_failed: usize,
    segments_read: usize,
    segments_failed: usize,
    events_submitted: usize,
    parse_errors: usize,
    cache_events_delivered: usize,
    cache_files_deleted: usize,
}

/// One sink's recurring pass: its own reader, batcher and bookmarks.
struct SinkPass<S: EventSink> {
    name: &'static str,
    source: JsonlSegmentSource,
    batcher: EventBatcher<S>,
    stopping: Arc<AtomicBool>,
    totals: Arc<Mutex<RunTotals>>,
}

impl<S: EventSink> SinkPass<S> {
    fn run(&mut self) -> PassControl {
        if self.stopping.load(Ordering::SeqCst) {
            return PassControl::Stop;
        }

        counter!("ingest_passes_total", "sink" => self.name).increment(1);
        let started = Instant::now();

        let result = self.source.read_pass(&mut self.batcher);
        histogram!("ingest_pass_duration_seconds", "sink" => self.name)
            .record(started.elapsed().as_secs_f64());

        let mut totals = self.totals.lock();
        totals.passes += 1;
        match result {
            Ok(stats) => {
                tracing::debug!(
                    "{} pass: {} segments, {} events, {} parse errors in {:?}",
                    self.name,
                    stats.segments_read,
                    stats.events_submitted,
                    stats.parse_errors,
                    started.elapsed()
                );
                if stats.segments_failed > 0 {
                    tracing::warn!(
                        "{} pass: {} segments failed and will be retried",
                        self.name,
                        stats.segments_failed
                    );
                }
                totals.segments_read += stats.segments_read;
                totals.segments_failed += stats.segments_failed;
                totals.events_submitted += stats.events_submitted;
                totals.parse_errors += stats.parse_errors;
            }
            Err(e) => {
                tracing::error!("{} pass failed: {}", self.name, e);
                counter!("ingest_passes_failed_total", "sink" => self.name).increment(1);
                totals.passes_failed += 1;
            }
        }

        if self.stopping.load(Ordering::SeqCst) {
            PassControl::Stop
        } else {
            PassControl::Continue
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("tracesieve_ingest=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = AgentConfig::from_env().context("Failed to load configuration")?;
    args.apply(&mut config);

    tracing::info!("Tracesieve ingestion daemon starting...");

    // Initialize metrics
    if config.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(config.metrics_port, metrics_handle).await?;
        gauge!("ingest_running").set(1.0);
    }

    // Set up graceful shutdown
    let stopping = Arc::new(AtomicBool::new(false));
    let scheduler = ThreadScheduler::new();

    let stopping_clone = Arc::clone(&stopping);
    let scheduler_clone = scheduler.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        stopping_clone.store(true, Ordering::SeqCst);
        scheduler_clone.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let compress = if config.compress && !detect_compression_support() {
        tracing::warn!("Compression unavailable; writing plain CSV artifacts");
        false
    } else {
        config.compress
    };

    tracing::info!("Configuration:");
    tracing::info!("  Input: {}", config.input_dir.display());
    tracing::info!("  Output: {}", config.output_dir.display());
    tracing::info!("  Bookmarks: {}", config.bookmark_dir.display());
    tracing::info!("  Sink: {:?}", config.sink);
    tracing::info!("  Resume: {:?}", config.resume);
    tracing::info!(
        "  Filter: {}",
        if config.filter.trim().is_empty() {
            "(include all)"
        } else {
            config.filter.as_str()
        }
    );
    tracing::info!("  Interval: {:?}", config.interval);
    tracing::info!("  Compress: {}", compress);

    let registry = FilterRegistry::new();
    let filter = InclusionFilter::parse(&config.filter, &FilterAliases::default())
        .with_context(|| format!("Invalid filter '{}'", config.filter))?;
    for dropped in filter.dropped_rules() {
        tracing::warn!("Filter rule {} ignored ({:?})", dropped.rule, dropped.reason);
    }
    let filter_handle = registry.install(APP_ID, filter);

    let totals = Arc::new(Mutex::new(RunTotals::default()));
    let mut announcer = None;

    if config.sink.includes_csv() {
        announcer = Some(start_csv_pass(
            &config,
            compress,
            filter_handle.clone(),
            &scheduler,
            &stopping,
            &totals,
        )?);
    }

    if config.sink.includes_cache() {
        start_cache_pass(&config, filter_handle, &scheduler, &stopping, &totals)?;
    }

    tracing::info!("Starting ingestion passes every {:?}...", config.interval);

    while !stopping.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    // Shutdown sequence
    tracing::info!("Shutting down...");
    scheduler.cancel();

    let join_scheduler = scheduler.clone();
    tokio::task::spawn_blocking(move || join_scheduler.join())
        .await
        .context("Pass scheduler panicked")?;

    // Passes are dropped with the scheduler's tasks, closing the artifact channel
    if let Some(handle) = announcer
        && handle.join().is_err()
    {
        tracing::warn!("Artifact announcer thread panicked");
    }

    // Mark as stopped
    gauge!("ingest_running").set(0.0);

    // Print summary
    let totals = totals.lock();
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Passes run:           {}", totals.passes);
    tracing::info!("Passes failed:        {}", totals.passes_failed);
    tracing::info!("Segments read:        {}", totals.segments_read);
    tracing::info!("Segments failed:      {}", totals.segments_failed);
    tracing::info!("Events submitted:     {}", totals.events_submitted);
    tracing::info!("Parse errors:         {}", totals.parse_errors);
    if config.sink.includes_cache() {
        tracing::info!("Cache events handed:  {}", totals.cache_events_delivered);
        tracing::info!("Cache files deleted:  {}", totals.cache_files_deleted);
    }

    Ok(())
}

/// Start the CSV pass. Returns the thread logging sealed artifacts.
fn start_csv_pass(
    config: &AgentConfig,
    compress: bool,
    filter: FilterHandle,
    scheduler: &ThreadScheduler,
    stopping: &Arc<AtomicBool>,
    totals: &Arc<Mutex<RunTotals>>,
) -> Result<std::thread::JoinHandle<()>> {
    let sink_config = SinkConfig {
        output_dir: config.output_dir.clone(),
        compress,
        ..Default::default()
    };

    let tracker: Arc<dyn ResumptionTracker> = match config.resume {
        ResumeKind::Bookmark => {
            let dir = config.bookmark_dir.join("csv");
            tracing::info!("Opening CSV bookmarks at {}", dir.display());
            Arc::new(
                BookmarkTracker::open(&dir)
                    .with_context(|| format!("Failed to open bookmark directory {:?}", dir))?,
            )
        }
        ResumeKind::Artifact => Arc::new(ArtifactTracker::new(
            &config.output_dir,
            &sink_config.file_prefix,
        )),
    };

    let (sealed_tx, sealed_rx) = crossbeam_channel::unbounded::<SealedArtifact>();
    let sink = CsvFileSink::new(sink_config, Some(sealed_tx))
        .with_context(|| "Failed to create CSV sink")?;

    let announcer = std::thread::spawn(move || {
        for artifact in sealed_rx {
            tracing::info!(
                "Artifact ready for {}: {} ({} events)",
                artifact.source_id,
                artifact.path.display(),
                artifact.event_count
            );
        }
    });

    let mut pass = SinkPass {
        name: "csv",
        source: new_source(config, stopping),
        batcher: EventBatcher::new(sink, tracker, filter),
        stopping: Arc::clone(stopping),
        totals: Arc::clone(totals),
    };

    schedule_recurring(
        Arc::new(scheduler.clone()),
        Duration::ZERO,
        config.interval,
        move || pass.run(),
    );

    Ok(announcer)
}

/// Start the cache pass: buffer new events, then hand cached files to the
/// local consumer and expire old ones.
fn start_cache_pass(
    config: &AgentConfig,
    filter: FilterHandle,
    scheduler: &ThreadScheduler,
    stopping: &Arc<AtomicBool>,
    totals: &Arc<Mutex<RunTotals>>,
) -> Result<()> {
    let cache_config = CacheConfig {
        dir: config.cache_dir.clone(),
        retention: config.cache_retention,
        ..Default::default()
    };

    let dir = config.bookmark_dir.join("cache");
    tracing::info!("Opening cache bookmarks at {}", dir.display());
    let tracker = Arc::new(
        BookmarkTracker::open(&dir)
            .with_context(|| format!("Failed to open bookmark directory {:?}", dir))?,
    );

    let sink = BufferedCacheSink::new(cache_config.clone())
        .with_context(|| format!("Failed to create cache sink at {:?}", cache_config.dir))?;
    let delivery = CacheDelivery::new(cache_config, Arc::clone(stopping));

    let mut pass = SinkPass {
        name: "cache",
        source: new_source(config, stopping),
        batcher: EventBatcher::new(sink, tracker, filter),
        stopping: Arc::clone(stopping),
        totals: Arc::clone(totals),
    };
    let totals = Arc::clone(totals);

    schedule_recurring(
        Arc::new(scheduler.clone()),
        Duration::ZERO,
        config.interval,
        move || {
            let control = pass.run();

            match delivery.deliver(|unique_id, event| {
                tracing::trace!(
                    "Cached event {} {}.{}: {}",
                    unique_id,
                    event.task_name,
                    event.event_type,
                    event.event_text
                );
                ConsumerControl::Continue
            }) {
                Ok(stats) => {
                    let mut totals = totals.lock();
                    totals.cache_events_delivered += stats.events_delivered;
                    totals.cache_files_deleted += stats.files_deleted;
                }
                Err(e) => tracing::error!("Cache delivery failed: {}", e),
            }

            match delivery.delete_old_files() {
                Ok(deleted) => totals.lock().cache_files_deleted += deleted,
                Err(e) => tracing::error!("Failed to expire cache files: {}", e),
            }

            control
        },
    );

    Ok(())
}

fn new_source(config: &AgentConfig, stopping: &Arc<AtomicBool>) -> JsonlSegmentSource {
    JsonlSegmentSource::new(
        JsonlConfig {
            input: config.input_dir.clone(),
            ..Default::default()
        },
        Arc::clone(stopping),
    )
}
