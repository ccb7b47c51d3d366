//! CSV artifact sink.
//!
//! Each delivered segment becomes one artifact in the source's output
//! directory. Events are written as buffered event lines (see
//! [`tracesieve_core::encode_event_line`]) to a temp file while the segment is
//! open.
//!
//! # Sealing
//!
//! On segment end:
//! 1. The writer is flushed (and the gzip stream finished, if compressing)
//! 2. The temp file is renamed to the artifact name of its last event, or
//!    removed if the segment delivered nothing
//! 3. A [`SealedArtifact`] notification is sent, if a channel is configured
//!
//! The artifact name embeds the index of the last event, which is what
//! [`crate::resume::ArtifactTracker`] reads back after a restart.

use super::EventSink;
use crate::resume::{artifact_file_name, source_output_dir};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use flate2::Compression;
use flate2::write::GzEncoder;
use metrics::counter;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracesieve_core::{EventIndex, TraceEvent, encode_event_line};
use tracing::{debug, info, warn};

const TEMP_SUFFIX: &str = ".inprogress.tmp";

/// Configuration for the CSV sink.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Root directory; each source gets a sub-directory.
    /// Default: "./output"
    pub output_dir: PathBuf,

    /// Prefix for artifact file names.
    /// Default: "trace"
    pub file_prefix: String,

    /// Gzip artifacts.
    /// Default: true
    pub compress: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            file_prefix: "trace".to_string(),
            compress: true,
        }
    }
}

/// Information about a sealed artifact.
#[derive(Debug, Clone)]
pub struct SealedArtifact {
    /// Source the events came from.
    pub source_id: String,

    /// Final path of the artifact.
    pub path: PathBuf,

    /// Number of events in the artifact.
    pub event_count: usize,

    /// Index of the last event, as encoded in the name.
    pub last_index: EventIndex,

    /// When the artifact was sealed.
    pub sealed_at: DateTime<Utc>,
}

enum ArtifactWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl ArtifactWriter {
    fn create(path: &Path, compress: bool) -> std::io::Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        Ok(if compress {
            ArtifactWriter::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            ArtifactWriter::Plain(file)
        })
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let writer: &mut dyn Write = match self {
            ArtifactWriter::Plain(w) => w,
            ArtifactWriter::Gzip(w) => w,
        };
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")
    }

    fn finish(self) -> std::io::Result<()> {
        let file = match self {
            ArtifactWriter::Plain(mut w) => {
                w.flush()?;
                w
            }
            ArtifactWriter::Gzip(w) => {
                let mut inner = w.finish()?;
                inner.flush()?;
                inner
            }
        };
        file.get_ref().sync_all()
    }
}

/// Internal state for the artifact being written.
struct OpenArtifact {
    source_id: String,
    dir: PathBuf,
    temp_path: PathBuf,
    writer: ArtifactWriter,
    event_count: usize,
    last_index: Option<EventIndex>,
}

/// Writes one artifact per delivered segment.
pub struct CsvFileSink {
    config: SinkConfig,
    current: Option<OpenArtifact>,
    total_events: usize,
    artifacts_sealed: usize,
    sealed_sender: Option<Sender<SealedArtifact>>,
}

impl CsvFileSink {
    /// Create a new CSV sink.
    ///
    /// # Arguments
    ///
    /// * `config` - Configuration for the sink
    /// * `sealed_sender` - Optional channel to send sealed artifact notifications
    pub fn new(config: SinkConfig, sealed_sender: Option<Sender<SealedArtifact>>) -> Result<Self> {
        fs::create_dir_all(&config.output_dir)?;

        info!(
            "CsvFileSink initialized: output_dir={}, prefix={}, compress={}",
            config.output_dir.display(),
            config.file_prefix,
            config.compress
        );

        Ok(Self {
            config,
            current: None,
            total_events: 0,
            artifacts_sealed: 0,
            sealed_sender,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    /// Total events written across all segments, including aborted ones.
    pub fn total_events(&self) -> usize {
        self.total_events
    }

    /// Number of artifacts renamed into place.
    pub fn artifacts_sealed(&self) -> usize {
        self.artifacts_sealed
    }

    fn temp_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}{}", self.config.file_prefix, TEMP_SUFFIX))
    }

    /// Remove temp files left behind by an interrupted pass.
    fn remove_leftovers(&self, dir: &Path) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_leftover = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(TEMP_SUFFIX));
            if is_leftover {
                warn!("Removing leftover temp file {}", path.display());
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn discard(&mut self) {
        if let Some(open) = self.current.take() {
            drop(open.writer);
            if let Err(e) = fs::remove_file(&open.temp_path) {
                warn!(
                    "Failed to remove temp file {}: {}",
                    open.temp_path.display(),
                    e
                );
            }
        }
    }

    fn sink_error(&self, reason: String) -> Error {
        Error::Sink {
            sink: self.name().to_string(),
            reason,
        }
    }
}

impl EventSink for CsvFileSink {
    fn name(&self) -> &str {
        "csv"
    }

    fn on_segment_start(&mut self, source_id: &str) -> Result<()> {
        if self.current.is_some() {
            warn!("Segment started while another was open; discarding the open one");
            self.discard();
        }

        let dir = source_output_dir(&self.config.output_dir, source_id);
        fs::create_dir_all(&dir)?;
        self.remove_leftovers(&dir)?;

        let temp_path = self.temp_path(&dir);
        debug!("Creating artifact temp file: {}", temp_path.display());
        let writer = ArtifactWriter::create(&temp_path, self.config.compress)?;

        self.current = Some(OpenArtifact {
            source_id: source_id.to_string(),
            dir,
            temp_path,
            writer,
            event_count: 0,
            last_index: None,
        });
        Ok(())
    }

    fn on_event(&mut self, event: &TraceEvent, index: EventIndex, stable_id: &str) -> Result<()> {
        let Some(open) = self.current.as_mut() else {
            return Err(self.sink_error("event delivered outside a segment".to_string()));
        };

        open.writer.write_line(&encode_event_line(stable_id, event))?;
        open.event_count += 1;
        open.last_index = Some(index);
        self.total_events += 1;
        counter!("sink_events_written_total", "sink" => "csv").increment(1);
        Ok(())
    }

    fn on_segment_end(&mut self, source_id: &str, is_active: bool) -> Result<()> {
        let Some(open) = self.current.take() else {
            return Err(self.sink_error(format!("segment end for {source_id} without a start")));
        };

        let OpenArtifact {
            source_id: open_source,
            dir,
            temp_path,
            writer,
            event_count,
            last_index,
        } = open;
        writer.finish()?;

        let Some(last_index) = last_index else {
            debug!("No events for {}; removing empty artifact", open_source);
            fs::remove_file(&temp_path)?;
            return Ok(());
        };

        let final_path = dir.join(artifact_file_name(
            &self.config.file_prefix,
            last_index,
            self.config.compress,
        ));
        fs::rename(&temp_path, &final_path)?;

        self.artifacts_sealed += 1;
        counter!("sink_artifacts_sealed_total", "sink" => "csv").increment(1);
        info!(
            "Sealed artifact for {} (active={}): {} events at {}",
            open_source,
            is_active,
            event_count,
            final_path.display()
        );

        let sealed = SealedArtifact {
            source_id: open_source,
            path: final_path,
            event_count,
            last_index,
            sealed_at: Utc::now(),
        };

        // Notify the consumer (if channel is configured)
        if let Some(sender) = &self.sealed_sender
            && let Err(e) = sender.send(sealed)
        {
            warn!("Failed to send sealed artifact notification: {}", e);
        }

        Ok(())
    }

    fn abort_segment(&mut self, source_id: &str) {
        debug!("Aborting artifact for {}", source_id);
        self.discard();
    }
}

impl Drop for CsvFileSink {
    fn drop(&mut self) {
        // An unfinished segment was never accepted; its events will be read again.
        self.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resume::parse_artifact_name;
    use chrono::TimeZone;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::TempDir;
    use tracesieve_core::decode_event_line;

    fn test_event(secs: i64, text: &str) -> TraceEvent {
        TraceEvent {
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            level: 3,
            thread_id: 1,
            process_id: 2,
            task_name: "Transport".to_string(),
            event_type: "Send".to_string(),
            event_text: text.to_string(),
        }
    }

    fn sink(tmp: &TempDir, compress: bool) -> CsvFileSink {
        let config = SinkConfig {
            output_dir: tmp.path().to_path_buf(),
            compress,
            ..Default::default()
        };
        CsvFileSink::new(config, None).unwrap()
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_artifact_named_after_last_event() {
        let tmp = TempDir::new().unwrap();
        let mut sink = sink(&tmp, false);

        sink.on_segment_start("trace_01").unwrap();
        let e1 = test_event(100, "one");
        let e2 = test_event(101, "two, with comma");
        sink.on_event(&e1, EventIndex::new(e1.timestamp, 0), "b_0").unwrap();
        sink.on_event(&e2, EventIndex::new(e2.timestamp, 1), "b_1").unwrap();
        sink.on_segment_end("trace_01", false).unwrap();

        let dir = source_output_dir(tmp.path(), "trace_01");
        let names = files_in(&dir);
        assert_eq!(names.len(), 1);
        assert_eq!(
            parse_artifact_name("trace", &names[0]),
            Some(EventIndex::new(e2.timestamp, 1))
        );

        let contents = fs::read_to_string(dir.join(&names[0])).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let (id, decoded) = decode_event_line(lines[1]).unwrap();
        assert_eq!(id, "b_1");
        assert_eq!(decoded, e2);
        assert_eq!(sink.artifacts_sealed(), 1);
    }

    #[test]
    fn test_compressed_artifact() {
        let tmp = TempDir::new().unwrap();
        let mut sink = sink(&tmp, true);

        sink.on_segment_start("s").unwrap();
        let e = test_event(5, "zipped");
        sink.on_event(&e, EventIndex::new(e.timestamp, 0), "b_0").unwrap();
        sink.on_segment_end("s", true).unwrap();

        let dir = source_output_dir(tmp.path(), "s");
        let names = files_in(&dir);
        assert!(names[0].ends_with(".csv.gz"));

        let mut text = String::new();
        GzDecoder::new(File::open(dir.join(&names[0])).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert!(text.ends_with("zipped\n"));
    }

    #[test]
    fn test_empty_segment_leaves_no_artifact() {
        let tmp = TempDir::new().unwrap();
        let mut sink = sink(&tmp, false);

        sink.on_segment_start("s").unwrap();
        sink.on_segment_end("s", true).unwrap();

        assert!(files_in(&source_output_dir(tmp.path(), "s")).is_empty());
    }

    #[test]
    fn test_abort_removes_temp_file() {
        let tmp = TempDir::new().unwrap();
        let mut sink = sink(&tmp, false);

        sink.on_segment_start("s").unwrap();
        let e = test_event(5, "lost");
        sink.on_event(&e, EventIndex::new(e.timestamp, 0), "b_0").unwrap();
        sink.abort_segment("s");

        assert!(files_in(&source_output_dir(tmp.path(), "s")).is_empty());
    }

    #[test]
    fn test_leftover_temp_file_removed_on_start() {
        let tmp = TempDir::new().unwrap();
        let dir = source_output_dir(tmp.path(), "s");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("old.inprogress.tmp"), b"partial").unwrap();

        let mut sink = sink(&tmp, false);
        sink.on_segment_start("s").unwrap();
        sink.on_segment_end("s", false).unwrap();

        assert!(files_in(&dir).is_empty());
    }

    #[test]
    fn test_event_outside_segment_is_error() {
        let tmp = TempDir::new().unwrap();
        let mut sink = sink(&tmp, false);
        let e = test_event(5, "x");
        let err = sink
            .on_event(&e, EventIndex::new(e.timestamp, 0), "b_0")
            .unwrap_err();
        assert!(matches!(err, Error::Sink { .. }));
    }

    #[test]
    fn test_sealed_channel_notification() {
        let tmp = TempDir::new().unwrap();
        let config = SinkConfig {
            output_dir: tmp.path().to_path_buf(),
            compress: false,
            ..Default::default()
        };

        let (sender, receiver) = crossbeam_channel::unbounded();
        let mut sink = CsvFileSink::new(config, Some(sender)).unwrap();

        sink.on_segment_start("s").unwrap();
        let e = test_event(7, "x");
        sink.on_event(&e, EventIndex::new(e.timestamp, 0), "b_0").unwrap();
        sink.on_segment_end("s", false).unwrap();

        let sealed = receiver.try_recv().unwrap();
        assert_eq!(sealed.event_count, 1);
        assert_eq!(sealed.source_id, "s");
        assert_eq!(sealed.last_index, EventIndex::new(e.timestamp, 0));
    }
}
