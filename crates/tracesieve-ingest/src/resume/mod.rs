//! Resumption watermarks.
//!
//! A watermark is the highest [`EventIndex`] already delivered to one sink for
//! one source segment. The batcher reads it when a segment opens and suppresses
//! every event at or below it, so re-reading a segment never duplicates output.
//!
//! Two backends implement [`ResumptionTracker`]:
//!
//! - [`BookmarkTracker`] - a small versioned record file per source
//! - [`ArtifactTracker`] - recovered from the names of the sink's own output
//!   files, which embed the index of their last event
//!
//! # Failure Handling
//!
//! A missing or unreadable record is a cold start: the watermark is
//! [`EventIndex::MIN`] and the whole segment is offered again. Under-counting
//! only causes re-delivery attempts, which the index comparison suppresses.
//! I/O that keeps failing after retries is returned as an error so the caller
//! can skip the segment for this pass.

mod artifact;
mod bookmark;

pub use artifact::{
    ARTIFACT_EXTENSION, ArtifactTracker, artifact_file_name, parse_artifact_name,
    source_output_dir,
};
pub use bookmark::{BOOKMARK_EXTENSION, BOOKMARK_VERSION, BookmarkTracker};

use crate::Result;
use tracesieve_core::EventIndex;

/// Persisted per-source delivery progress.
///
/// Implementations are shared between passes and must serialize their own
/// writes.
pub trait ResumptionTracker: Send + Sync {
    /// Human-readable name for this backend (used in logs).
    fn name(&self) -> &'static str;

    /// The highest index already delivered for `source_id`.
    ///
    /// Returns [`EventIndex::MIN`] when there is no usable record.
    fn max_index_already(&self, source_id: &str) -> Result<EventIndex>;

    /// Record that everything up to `index` has been durably delivered.
    ///
    /// Never moves the watermark backwards.
    fn advance(&self, source_id: &str, index: EventIndex) -> Result<()>;
}

/// Map a source id to a string usable as a single path component.
///
/// ASCII letters, digits and `-` are kept. Every other byte of the UTF-8 form,
/// `_` included, becomes `_XX` with `XX` its uppercase hex value. Distinct ids
/// therefore never share a record or an output directory.
pub fn sanitize_source_id(source_id: &str) -> String {
    if source_id.is_empty() {
        // Never produced by the escaping below, which always follows `_` with
        // two hex digits.
        return "_".to_string();
    }

    let mut sanitized = String::with_capacity(source_id.len());
    for byte in source_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            sanitized.push(char::from(byte));
        } else {
            sanitized.push_str(&format!("_{byte:02X}"));
        }
    }
    sanitized
}
