//! JSONL segment source.
//!
//! Reads decoded trace events from a directory of JSONL files (one JSON event
//! per line). Each file is one segment, read in file name order. Unless
//! configured otherwise the last file is the active segment, still being
//! appended to by its producer.
//!
//! # Bookmarks
//!
//! A bookmark is `<file name>:<byte offset>`. Each pass resumes a file at the
//! offset recorded by the previous pass:
//!
//! - a closed file resumes at its end, so it is read once
//! - an active file resumes at the start of its trailing timestamp batch, so
//!   the next pass re-reads that batch in full
//!
//! Offsets live in memory only. After a restart every file is read from the
//! start and the resumption watermark suppresses what was already delivered.

use super::{PassStats, SegmentHandler, SegmentSource};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracesieve_core::TraceEvent;
use tracing::{debug, info, warn};

/// Configuration for the JSONL source.
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    /// Directory holding the segment files.
    pub input: PathBuf,

    /// Treat the last file as active.
    /// Default: true
    pub last_is_active: bool,

    /// Progress reporting interval (events).
    /// Default: 100000
    pub progress_interval: usize,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            last_is_active: true,
            progress_interval: 100_000,
        }
    }
}

/// Format a bookmark.
fn bookmark(file_name: &str, offset: u64) -> String {
    format!("{file_name}:{offset}")
}

/// JSONL directory segment source.
pub struct JsonlSegmentSource {
    config: JsonlConfig,
    stopping: Arc<AtomicBool>,
    positions: HashMap<String, u64>,
}

impl JsonlSegmentSource {
    /// Create a new JSONL source.
    ///
    /// Setting `stopping` ends a pass after the current event.
    pub fn new(config: JsonlConfig, stopping: Arc<AtomicBool>) -> Self {
        Self {
            config,
            stopping,
            positions: HashMap::new(),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &JsonlConfig {
        &self.config
    }

    /// Offset the next pass resumes `file_name` at.
    pub fn position(&self, file_name: &str) -> u64 {
        self.positions.get(file_name).copied().unwrap_or(0)
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Collect segment files in processing order.
    fn collect_files(&self) -> Result<Vec<PathBuf>> {
        let input = &self.config.input;
        if !input.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Input directory does not exist: {}", input.display()),
            )));
        }

        let mut files: Vec<_> = fs::read_dir(input)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "jsonl"))
            .collect();

        // Sort for deterministic processing order
        files.sort();
        Ok(files)
    }

    /// Read one segment from its recorded offset.
    fn read_segment(
        &mut self,
        path: &Path,
        is_active: bool,
        handler: &mut dyn SegmentHandler,
        stats: &mut PassStats,
    ) -> Result<()> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let source_id = path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let len = fs::metadata(path)?.len();
        let mut start = self.position(&file_name);
        if start > len {
            warn!(
                "{} is shorter than its bookmark {}; reading it from the start",
                file_name, start
            );
            start = 0;
        }
        if !is_active && start == len && len > 0 {
            debug!("{} fully read; skipping", file_name);
            return Ok(());
        }

        let mut reader = BufReader::new(File::open(path)?);
        reader.seek(SeekFrom::Start(start))?;

        let current = bookmark(&file_name, start);
        if let Err(e) = handler.segment_start(&source_id, &current) {
            warn!("Skipping segment {} at {}: {}", source_id, current, e);
            stats.segments_failed += 1;
            return Ok(());
        }
        stats.segments_read += 1;

        let mut offset = start;
        let mut batch_start = start;
        let mut batch_timestamp: Option<DateTime<Utc>> = None;
        let mut interrupted = false;
        let mut line = String::new();

        loop {
            if self.is_stopping() {
                info!("Stopping; {} interrupted at {}", file_name, offset);
                stats.stopped = true;
                interrupted = true;
                break;
            }

            line.clear();
            let line_start = offset;
            let read = match reader.read_line(&mut line) {
                Ok(read) => read,
                Err(e) => {
                    warn!("{}: read error at {}: {}", file_name, offset, e);
                    interrupted = true;
                    break;
                }
            };
            if read == 0 {
                break;
            }
            if is_active && !line.ends_with('\n') {
                // The producer is still writing this line.
                break;
            }
            offset += read as u64;

            let text = line.trim();
            if text.is_empty() {
                continue;
            }

            let event: TraceEvent = match serde_json::from_str(text) {
                Ok(event) => event,
                Err(e) => {
                    warn!("{}: skipping malformed event at {}: {}", file_name, line_start, e);
                    stats.parse_errors += 1;
                    continue;
                }
            };

            match batch_timestamp {
                Some(ts) if event.timestamp < ts => {
                    warn!(
                        "{}: dropping out-of-order event at {} ({} after {})",
                        file_name, line_start, event.timestamp, ts
                    );
                    stats.parse_errors += 1;
                    continue;
                }
                Some(ts) if event.timestamp == ts => {}
                _ => {
                    batch_start = line_start;
                    batch_timestamp = Some(event.timestamp);
                }
            }

            handler.submit(event);
            stats.events_submitted += 1;

            if stats
                .events_submitted
                .is_multiple_of(self.config.progress_interval.max(1))
            {
                info!("Progress: {} events submitted", stats.events_submitted);
            }
        }

        stats.bytes_read += offset - start;

        // An interrupted segment is ended as active: its tail is read again.
        let ended_active = is_active || interrupted;
        let next_offset = if ended_active { batch_start } else { offset };
        let next = bookmark(&file_name, next_offset);

        match handler.segment_end(ended_active, &current, &next) {
            Ok(_) => {
                self.positions.insert(file_name, next_offset);
            }
            Err(e) => {
                warn!(
                    "Segment {} at {} failed and will be retried: {}",
                    source_id, current, e
                );
                stats.segments_failed += 1;
            }
        }

        Ok(())
    }
}

impl SegmentSource for JsonlSegmentSource {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn read_pass(&mut self, handler: &mut dyn SegmentHandler) -> Result<PassStats> {
        let mut stats = PassStats::default();
        let files = self.collect_files()?;
        debug!("Found {} JSONL segments", files.len());

        // Forget offsets of files that are gone.
        self.positions.retain(|name, _| {
            files
                .iter()
                .any(|p| p.file_name().is_some_and(|n| n.to_string_lossy() == name.as_str()))
        });

        let last = files.len().saturating_sub(1);
        for (file_idx, path) in files.iter().enumerate() {
            if self.is_stopping() {
                info!("Stopping; no more segments will be opened");
                stats.stopped = true;
                break;
            }

            let is_active = self.config.last_is_active && file_idx == last;
            if let Err(e) = self.read_segment(path, is_active, handler, &mut stats) {
                warn!("Error reading {}: {}", path.display(), e);
                stats.segments_failed += 1;
            }
        }

        Ok(stats)
    }
}
