//! Watermarks recovered from sink artifact names.
//!
//! File-backed sinks name each finished artifact after the index of the last
//! event it contains:
//!
//! ```text
//! <output dir>/<source>/<prefix>_<timestamp key>_<differentiator>.csv[.gz]
//! ```
//!
//! The timestamp key is the binary timestamp (nanoseconds) with its sign bit
//! flipped, written as 39 zero-padded digits, and the differentiator is padded to 10 digits.
//! Both are fixed width, so sorting names lexicographically sorts them by
//! index and the newest artifact is simply the last name.

use super::{ResumptionTracker, sanitize_source_id};
use crate::retry::{RetryPolicy, retry_io};
use crate::Result;
use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracesieve_core::EventIndex;
use tracing::{debug, error, info};

/// Extension of uncompressed artifacts.
pub const ARTIFACT_EXTENSION: &str = "csv";

const GZIP_SUFFIX: &str = ".gz";
const SIGN_BIT: u128 = 1 << 127;
const KEY_DIGITS: usize = 39;
const DIFFERENTIATOR_DIGITS: usize = 10;

/// Directory holding a source's artifacts.
pub fn source_output_dir(output_dir: &Path, source_id: &str) -> PathBuf {
    output_dir.join(sanitize_source_id(source_id))
}

/// Name of the artifact whose last event has `index`.
pub fn artifact_file_name(prefix: &str, index: EventIndex, compressed: bool) -> String {
    let key = (index.timestamp_binary() as u128) ^ SIGN_BIT;
    format!(
        "{}_{:0kw$}_{:0dw$}.{}{}",
        prefix,
        key,
        index.differentiator,
        ARTIFACT_EXTENSION,
        if compressed { GZIP_SUFFIX } else { "" },
        kw = KEY_DIGITS,
        dw = DIFFERENTIATOR_DIGITS,
    )
}

/// Recover the index embedded in an artifact name.
///
/// Returns `None` for names that are not artifacts of `prefix`.
pub fn parse_artifact_name(prefix: &str, name: &str) -> Option<EventIndex> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('_')?;
    let rest = rest.strip_suffix(GZIP_SUFFIX).unwrap_or(rest);
    let rest = rest.strip_suffix(ARTIFACT_EXTENSION)?.strip_suffix('.')?;

    let (key, differentiator) = rest.split_once('_')?;
    if key.len() != KEY_DIGITS || differentiator.len() != DIFFERENTIATOR_DIGITS {
        return None;
    }

    let key: u128 = key.parse().ok()?;
    let differentiator: u32 = differentiator.parse().ok()?;
    EventIndex::from_binary((key ^ SIGN_BIT) as i128, differentiator).ok()
}

/// Watermarks derived from the newest artifact of each source.
///
/// The sink is the one that makes artifacts durable, so `advance` only keeps
/// the in-memory view current. After a restart the watermark is recovered by
/// listing the source's output directory.
pub struct ArtifactTracker {
    output_dir: PathBuf,
    prefix: String,
    policy: RetryPolicy,
    cache: Mutex<HashMap<String, EventIndex>>,
}

impl ArtifactTracker {
    /// Create a tracker over artifacts named with `prefix` under `output_dir`.
    pub fn new<P: AsRef<Path>>(output_dir: P, prefix: &str) -> Self {
        Self::with_policy(output_dir, prefix, RetryPolicy::steady_state())
    }

    /// Create a tracker with an explicit retry policy for directory listing.
    pub fn with_policy<P: AsRef<Path>>(output_dir: P, prefix: &str, policy: RetryPolicy) -> Self {
        let output_dir = output_dir.as_ref().to_path_buf();
        info!(
            "Artifact tracker initialized: output_dir={}, prefix={}",
            output_dir.display(),
            prefix
        );

        Self {
            output_dir,
            prefix: prefix.to_string(),
            policy,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn newest_artifact_index(&self, source_id: &str) -> Result<EventIndex> {
        let dir = source_output_dir(&self.output_dir, source_id);
        let description = format!("list artifacts in {}", dir.display());

        let mut names = retry_io(&self.policy, &description, || {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
            let mut names = Vec::new();
            for entry in entries {
                names.push(entry?.file_name().to_string_lossy().into_owned());
            }
            Ok(names)
        })
        .inspect_err(|e| {
            counter!("resume_io_failures_total").increment(1);
            error!("Failed to list artifacts for {}: {}", source_id, e);
        })?;
        names.sort();

        let newest = names
            .iter()
            .rev()
            .find_map(|name| parse_artifact_name(&self.prefix, name));

        match newest {
            Some(index) => {
                debug!("Recovered watermark for {} from artifacts: {}", source_id, index);
                Ok(index)
            }
            None => {
                info!("No artifacts for {}; starting from the beginning", source_id);
                counter!("resume_cold_starts_total").increment(1);
                Ok(EventIndex::MIN)
            }
        }
    }
}

impl ResumptionTracker for ArtifactTracker {
    fn name(&self) -> &'static str {
        "artifact"
    }

    fn max_index_already(&self, source_id: &str) -> Result<EventIndex> {
        if let Some(index) = self.cache.lock().get(source_id) {
            return Ok(*index);
        }

        let index = self.newest_artifact_index(source_id)?;
        // A concurrent advance may have raced the listing; keep the higher one.
        let mut cache = self.cache.lock();
        let entry = cache.entry(source_id.to_string()).or_insert(index);
        *entry = (*entry).max(index);
        Ok(*entry)
    }

    fn advance(&self, source_id: &str, index: EventIndex) -> Result<()> {
        let mut cache = self.cache.lock();
        let entry = cache.entry(source_id.to_string()).or_insert(EventIndex::MIN);
        if index > *entry {
            *entry = index;
            counter!("resume_watermark_advances_total").increment(1);
            debug!("Advanced artifact watermark for {} to {}", source_id, index);
        }
        Ok(())
    }
}
