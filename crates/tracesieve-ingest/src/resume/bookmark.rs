//! Record-file watermark backend.
//!
//! # Record Format
//!
//! ```text
//! Version: 2
//! <timestampBinary>,<timestampHuman>,<differentiator>
//! ```
//!
//! The binary timestamp is nanoseconds since the Unix epoch. Version 1 records
//! held microseconds and are treated as a cold start. The human form is
//! informational and ignored on read. If several index lines are present the
//! highest one is used.
//!
//! Records are replaced atomically: the new content is written to a temp file
//! in the same directory, synced, and renamed over the old record.

use super::{ResumptionTracker, sanitize_source_id};
use crate::retry::{RetryPolicy, retry_io};
use crate::Result;
use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracesieve_core::EventIndex;
use tracing::{debug, error, info, warn};

/// Version written on the first line of every record.
pub const BOOKMARK_VERSION: u32 = 2;

/// Extension of record files.
pub const BOOKMARK_EXTENSION: &str = "bmk";

const VERSION_PREFIX: &str = "Version: ";

/// Watermarks stored as one record file per source.
pub struct BookmarkTracker {
    dir: PathBuf,
    policy: RetryPolicy,
    cache: Mutex<HashMap<String, EventIndex>>,
    file_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl BookmarkTracker {
    /// Open a tracker storing records in `dir`.
    ///
    /// The directory is created with the initialization retry policy, so this
    /// only returns once it exists.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::with_policies(dir, &RetryPolicy::initialization(), RetryPolicy::steady_state())
    }

    /// Open a tracker with explicit retry policies.
    ///
    /// `init_policy` applies to creating the directory, `policy` to every
    /// record read and write afterwards.
    pub fn with_policies<P: AsRef<Path>>(
        dir: P,
        init_policy: &RetryPolicy,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        retry_io(init_policy, "create bookmark directory", || {
            fs::create_dir_all(&dir)
        })?;

        info!("Bookmark tracker initialized: dir={}", dir.display());

        Ok(Self {
            dir,
            policy,
            cache: Mutex::new(HashMap::new()),
            file_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding the record files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record file for a source.
    pub fn record_path(&self, source_id: &str) -> PathBuf {
        self.dir.join(format!(
            "{}.{}",
            sanitize_source_id(source_id),
            BOOKMARK_EXTENSION
        ))
    }

    /// Forget cached watermarks so the next lookup re-reads the records.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.file_locks.lock();
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }

    fn load(&self, source_id: &str) -> Result<EventIndex> {
        let path = self.record_path(source_id);
        let description = format!("read bookmark {}", path.display());

        let contents = retry_io(&self.policy, &description, || {
            match fs::read_to_string(&path) {
                Ok(text) => Ok(Some(text)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            }
        })
        .inspect_err(|e| {
            counter!("resume_io_failures_total").increment(1);
            error!("Failed to read bookmark for {}: {}", source_id, e);
        })?;

        let Some(contents) = contents else {
            info!("No bookmark for {}; starting from the beginning", source_id);
            counter!("resume_cold_starts_total").increment(1);
            return Ok(EventIndex::MIN);
        };

        match parse_record(&contents) {
            Ok(index) => {
                debug!("Loaded bookmark for {}: {}", source_id, index);
                Ok(index)
            }
            Err(reason) => {
                warn!(
                    "Ignoring bookmark {} for {}: {}; starting from the beginning",
                    path.display(),
                    source_id,
                    reason
                );
                counter!("resume_cold_starts_total").increment(1);
                Ok(EventIndex::MIN)
            }
        }
    }

    fn store(&self, path: &Path, index: EventIndex) -> Result<()> {
        let contents = format_record(index);
        let description = format!("write bookmark {}", path.display());

        retry_io(&self.policy, &description, || {
            let mut temp = NamedTempFile::new_in(&self.dir)?;
            temp.write_all(contents.as_bytes())?;
            temp.as_file().sync_all()?;
            temp.persist(path).map_err(|e| e.error)?;
            Ok(())
        })
        .inspect_err(|_| {
            counter!("resume_io_failures_total").increment(1);
        })
    }
}

impl ResumptionTracker for BookmarkTracker {
    fn name(&self) -> &'static str {
        "bookmark"
    }

    fn max_index_already(&self, source_id: &str) -> Result<EventIndex> {
        if let Some(index) = self.cache.lock().get(source_id) {
            return Ok(*index);
        }

        let index = self.load(source_id)?;
        self.cache.lock().insert(source_id.to_string(), index);
        Ok(index)
    }

    fn advance(&self, source_id: &str, index: EventIndex) -> Result<()> {
        let path = self.record_path(source_id);
        let lock = self.file_lock(&path);
        let _guard = lock.lock();

        let current = self.max_index_already(source_id)?;
        if index <= current {
            debug!(
                "Bookmark for {} already at {}, not moving to {}",
                source_id, current, index
            );
            return Ok(());
        }

        if let Err(e) = self.store(&path, index) {
            error!(
                "Failed to persist bookmark {} for {}: {}",
                index, source_id, e
            );
            return Err(e);
        }

        self.cache.lock().insert(source_id.to_string(), index);
        counter!("resume_watermark_advances_total").increment(1);
        debug!("Advanced bookmark for {} to {}", source_id, index);
        Ok(())
    }
}

fn format_record(index: EventIndex) -> String {
    format!(
        "{}{}\n{},{},{}\n",
        VERSION_PREFIX,
        BOOKMARK_VERSION,
        index.timestamp_binary(),
        index.timestamp_human(),
        index.differentiator
    )
}

/// Parse a record, returning why it is unusable on failure.
fn parse_record(contents: &str) -> std::result::Result<EventIndex, String> {
    let mut lines = contents.lines();

    let version_line = lines.next().ok_or("empty record")?;
    let version: u32 = version_line
        .strip_prefix(VERSION_PREFIX)
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| format!("unreadable version line '{version_line}'"))?;
    if version != BOOKMARK_VERSION {
        return Err(format!(
            "version {version} does not match expected version {BOOKMARK_VERSION}"
        ));
    }

    let mut max = EventIndex::MIN;
    for line in lines.map(str::trim).filter(|l| !l.is_empty()) {
        let parts: Vec<&str> = line.split(',').collect();
        if parts.len() != 3 {
            return Err(format!("malformed index line '{line}'"));
        }

        let binary: i128 = parts[0]
            .parse()
            .map_err(|_| format!("bad timestamp in '{line}'"))?;
        let differentiator: u32 = parts[2]
            .parse()
            .map_err(|_| format!("bad differentiator in '{line}'"))?;
        let index = EventIndex::from_binary(binary, differentiator).map_err(|e| e.to_string())?;

        max = max.max(index);
    }

    Ok(max)
}
