//! Buffered cache sink and its delivery pass.
//!
//! [`BufferedCacheSink`] writes each delivered segment to a cache file:
//!
//! ```text
//! Cache_<micros>_<n>.tmp   while the segment is open
//! Cache_<micros>_<n>.dat   once the segment ended
//! ```
//!
//! Every file starts with a `Version: <n>` line followed by one buffered event
//! line per event. [`CacheDelivery`] later drains the `.dat` files to a consumer
//! on its own timer, newest first, and deletes them once fully delivered.

use super::EventSink;
use crate::retry::{RetryPolicy, retry_io};
use crate::{Error, Result};
use chrono::Utc;
use metrics::counter;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tracesieve_core::{
    EVENT_FILE_FORMAT_VERSION, EventIndex, TraceEvent, decode_event_line, encode_event_line,
};
use tracing::{debug, error, info, warn};

/// File name prefix of cache files.
pub const CACHE_FILE_PREFIX: &str = "Cache_";

const TEMP_EXTENSION: &str = "tmp";
const DATA_EXTENSION: &str = "dat";
const VERSION_PREFIX: &str = "Version: ";

/// Configuration for the buffered cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding cache files.
    /// Default: "./cache"
    pub dir: PathBuf,

    /// Files older than this are neither delivered nor kept.
    /// Default: 3 days
    pub retention: Duration,

    /// Wall time after which a delivery pass stops opening new files.
    /// Default: 15 seconds
    pub delivery_budget: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cache"),
            retention: Duration::from_secs(3 * 24 * 60 * 60),
            delivery_budget: Duration::from_secs(15),
        }
    }
}

fn is_cache_file(path: &Path, extension: &str) -> bool {
    path.extension().is_some_and(|ext| ext == extension)
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(CACHE_FILE_PREFIX))
}

fn list_cache_files(dir: &Path, extension: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if is_cache_file(&path, extension) {
            files.push(path);
        }
    }
    Ok(files)
}

// ═══════════════════════════════════════════════════════════════════════════
// Sink
// ═══════════════════════════════════════════════════════════════════════════

struct OpenCacheFile {
    temp_path: PathBuf,
    writer: BufWriter<File>,
    event_count: usize,
}

/// Writes delivered segments to versioned cache files.
pub struct BufferedCacheSink {
    config: CacheConfig,
    current: Option<OpenCacheFile>,
    files_created: u64,
}

impl BufferedCacheSink {
    /// Create a sink writing to `config.dir`.
    ///
    /// Temp files left by an interrupted run are promoted to `.dat`.
    pub fn new(config: CacheConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let sink = Self {
            config,
            current: None,
            files_created: 0,
        };
        sink.promote_leftovers()?;

        info!("BufferedCacheSink initialized: dir={}", sink.config.dir.display());
        Ok(sink)
    }

    /// Get the configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn next_temp_path(&mut self) -> PathBuf {
        let micros = Utc::now().timestamp_micros().max(0);
        let n = self.files_created;
        self.files_created += 1;
        self.config.dir.join(format!(
            "{CACHE_FILE_PREFIX}{micros:020}_{n:06}.{TEMP_EXTENSION}"
        ))
    }

    fn promote(path: &Path) -> std::io::Result<()> {
        fs::rename(path, path.with_extension(DATA_EXTENSION))
    }

    /// Rename temp files that are not currently being written to `.dat`.
    fn promote_leftovers(&self) -> Result<()> {
        for path in list_cache_files(&self.config.dir, TEMP_EXTENSION)? {
            if self
                .current
                .as_ref()
                .is_some_and(|open| open.temp_path == path)
            {
                continue;
            }
            info!("Promoting leftover cache file {}", path.display());
            Self::promote(&path)?;
        }
        Ok(())
    }

    fn discard(&mut self) {
        if let Some(open) = self.current.take() {
            drop(open.writer);
            if let Err(e) = fs::remove_file(&open.temp_path) {
                warn!(
                    "Failed to remove cache temp file {}: {}",
                    open.temp_path.display(),
                    e
                );
            }
        }
    }
}

impl EventSink for BufferedCacheSink {
    fn name(&self) -> &str {
        "cache"
    }

    fn on_segment_start(&mut self, source_id: &str) -> Result<()> {
        if self.current.is_some() {
            warn!("Segment started while another was open; discarding the open one");
            self.discard();
        }

        let temp_path = self.next_temp_path();
        debug!(
            "Creating cache file {} for {}",
            temp_path.display(),
            source_id
        );
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        writeln!(writer, "{VERSION_PREFIX}{EVENT_FILE_FORMAT_VERSION}")?;

        self.current = Some(OpenCacheFile {
            temp_path,
            writer,
            event_count: 0,
        });
        Ok(())
    }

    fn on_event(&mut self, event: &TraceEvent, _index: EventIndex, stable_id: &str) -> Result<()> {
        let open = self.current.as_mut().ok_or_else(|| Error::Sink {
            sink: "cache".to_string(),
            reason: "event delivered outside a segment".to_string(),
        })?;

        writeln!(open.writer, "{}", encode_event_line(stable_id, event))?;
        open.event_count += 1;
        counter!("sink_events_written_total", "sink" => "cache").increment(1);
        Ok(())
    }

    fn on_segment_end(&mut self, source_id: &str, _is_active: bool) -> Result<()> {
        let open = self.current.take().ok_or_else(|| Error::Sink {
            sink: "cache".to_string(),
            reason: format!("segment end for {source_id} without a start"),
        })?;

        let OpenCacheFile {
            temp_path,
            mut writer,
            event_count,
        } = open;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        if event_count == 0 {
            fs::remove_file(&temp_path)?;
        } else {
            Self::promote(&temp_path)?;
            counter!("sink_artifacts_sealed_total", "sink" => "cache").increment(1);
            debug!("Cached {} events for {}", event_count, source_id);
        }

        self.promote_leftovers()
    }

    fn abort_segment(&mut self, source_id: &str) {
        debug!("Aborting cache file for {}", source_id);
        self.discard();
    }
}

impl Drop for BufferedCacheSink {
    fn drop(&mut self) {
        self.discard();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Delivery
// ═══════════════════════════════════════════════════════════════════════════

/// What the consumer wants after receiving an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerControl {
    /// Keep delivering.
    Continue,
    /// End this delivery pass. The current file is kept for the next pass.
    Abort,
}

/// Statistics from one delivery pass.
#[derive(Debug, Clone, Default)]
pub struct DeliveryStats {
    /// Files whose events were all delivered.
    pub files_delivered: usize,

    /// Files deleted at the end of the pass.
    pub files_deleted: usize,

    /// Events handed to the consumer.
    pub events_delivered: usize,

    /// Lines that could not be decoded.
    pub lines_skipped: usize,

    /// Files left for a later pass.
    pub backlog: usize,

    /// The consumer aborted the pass.
    pub aborted: bool,

    /// The pass stopped because its time budget ran out.
    pub budget_exhausted: bool,
}

enum FileOutcome {
    Completed,
    Aborted,
    Stopped,
}

/// Drains cache files to a consumer.
pub struct CacheDelivery {
    config: CacheConfig,
    stopping: Arc<AtomicBool>,
    policy: RetryPolicy,
}

impl CacheDelivery {
    /// Create a delivery pass runner.
    ///
    /// Setting `stopping` ends a pass after the current event.
    pub fn new(config: CacheConfig, stopping: Arc<AtomicBool>) -> Self {
        Self {
            config,
            stopping,
            policy: RetryPolicy::steady_state(),
        }
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Cache files newer than the retention age, newest first.
    fn deliverable_files(&self) -> Result<Vec<PathBuf>> {
        let cutoff = SystemTime::now()
            .checked_sub(self.config.retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut files = Vec::new();
        for path in list_cache_files(&self.config.dir, DATA_EXTENSION)? {
            let modified = fs::metadata(&path)?.modified()?;
            if modified > cutoff {
                files.push((modified, path));
            }
        }

        files.sort_by(|a, b| b.cmp(a));
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    /// Run one delivery pass.
    ///
    /// Files are processed newest first. A file is deleted once all of its
    /// events were handed to the consumer; a file interrupted by an abort or
    /// by the stopping flag is kept and delivered again on a later pass.
    pub fn deliver<F>(&self, mut consumer: F) -> Result<DeliveryStats>
    where
        F: FnMut(&str, &TraceEvent) -> ConsumerControl,
    {
        let mut stats = DeliveryStats::default();
        let files = self.deliverable_files()?;
        let deadline = Instant::now() + self.config.delivery_budget;
        let mut to_delete = Vec::new();

        for (position, path) in files.iter().enumerate() {
            if self.is_stopping() {
                info!("Stopping; no more cache files will be delivered");
                stats.backlog = files.len() - position;
                break;
            }

            let outcome = match self.deliver_file(path, &mut consumer, &mut stats) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Failed to read cache file {}: {}", path.display(), e);
                    continue;
                }
            };

            match outcome {
                FileOutcome::Completed => {
                    stats.files_delivered += 1;
                    to_delete.push(path.clone());
                }
                FileOutcome::Aborted => {
                    info!("Delivery pass aborted by the consumer at {}", path.display());
                    stats.aborted = true;
                    stats.backlog = files.len() - position;
                    break;
                }
                FileOutcome::Stopped => {
                    info!("Stopping; delivery of {} interrupted", path.display());
                    stats.backlog = files.len() - position;
                    break;
                }
            }

            if Instant::now() > deadline {
                info!("Delivery time budget used up; remaining cache files wait for the next pass");
                stats.budget_exhausted = true;
                stats.backlog = files.len() - position - 1;
                break;
            }
        }

        for path in to_delete {
            let description = format!("delete cache file {}", path.display());
            match retry_io(&self.policy, &description, || fs::remove_file(&path)) {
                Ok(()) => {
                    stats.files_deleted += 1;
                    counter!("cache_files_deleted_total").increment(1);
                }
                Err(e) => error!("{}", e),
            }
        }

        debug!(
            "Delivery pass: {} files, {} events, backlog {}",
            stats.files_delivered, stats.events_delivered, stats.backlog
        );
        Ok(stats)
    }

    fn deliver_file<F>(
        &self,
        path: &Path,
        consumer: &mut F,
        stats: &mut DeliveryStats,
    ) -> Result<FileOutcome>
    where
        F: FnMut(&str, &TraceEvent) -> ConsumerControl,
    {
        let mut lines = BufReader::new(File::open(path)?).lines();

        let version = match lines.next().transpose()? {
            Some(line) => line
                .strip_prefix(VERSION_PREFIX)
                .and_then(|v| v.trim().parse::<u32>().ok()),
            None => None,
        };
        if version != Some(EVENT_FILE_FORMAT_VERSION) {
            // Nothing in the file can be read; it is deleted with the delivered ones.
            error!(
                "Cache file {} has missing or unsupported version {:?}; skipping it",
                path.display(),
                version
            );
            return Ok(FileOutcome::Completed);
        }

        for (line_num, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let (unique_id, event) = match decode_event_line(&line) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(
                        "{} line {}: skipping undecodable event: {}",
                        path.display(),
                        line_num + 2,
                        e
                    );
                    stats.lines_skipped += 1;
                    continue;
                }
            };

            let control = consumer(&unique_id, &event);
            stats.events_delivered += 1;
            counter!("cache_events_delivered_total").increment(1);

            if control == ConsumerControl::Abort {
                return Ok(FileOutcome::Aborted);
            }
            if self.is_stopping() {
                return Ok(FileOutcome::Stopped);
            }
        }

        Ok(FileOutcome::Completed)
    }

    /// Delete cache files older than the retention age.
    ///
    /// Returns the number of files deleted.
    pub fn delete_old_files(&self) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(self.config.retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut deleted = 0;

        for path in list_cache_files(&self.config.dir, DATA_EXTENSION)? {
            if self.is_stopping() {
                break;
            }

            let modified = fs::metadata(&path)?.modified()?;
            if modified > cutoff {
                continue;
            }

            let description = format!("delete old cache file {}", path.display());
            match retry_io(&self.policy, &description, || fs::remove_file(&path)) {
                Ok(()) => {
                    deleted += 1;
                    counter!("cache_files_deleted_total").increment(1);
                }
                Err(e) => error!("{}", e),
            }
        }

        if deleted > 0 {
            info!("Deleted {} expired cache files", deleted);
        }
        Ok(deleted)
    }
}
