//! Gzip capability detection.
//!
//! Sinks that can compress their output take a plain `compress: bool`. The
//! daemon computes it once at startup with [`detect_compression_support`] and
//! combines it with the user's choice.

use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;
use tracing::{debug, warn};

/// Probe whether gzip output works in this process.
///
/// Compresses a small buffer in memory. Any failure disables compression
/// instead of failing startup.
pub fn detect_compression_support() -> bool {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let probe = encoder
        .write_all(b"tracesieve compression probe")
        .and_then(|()| encoder.finish());

    match probe {
        Ok(bytes) if !bytes.is_empty() => {
            debug!("Gzip compression available");
            true
        }
        Ok(_) => {
            warn!("Gzip probe produced no output; compression disabled");
            false
        }
        Err(e) => {
            warn!("Gzip probe failed, compression disabled: {}", e);
            false
        }
    }
}
