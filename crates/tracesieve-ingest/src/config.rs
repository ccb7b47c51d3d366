//! Agent configuration loaded from environment variables.
//!
//! The daemon reads an [`AgentConfig`] first and lets command-line arguments
//! override individual fields.

use crate::{Error, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which sinks the daemon feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SinkKind {
    /// CSV artifacts per source.
    Csv,
    /// Buffered cache files for a local consumer.
    Cache,
    /// Both, on independent timers.
    Both,
}

impl SinkKind {
    /// Whether the CSV sink is enabled.
    pub fn includes_csv(self) -> bool {
        matches!(self, SinkKind::Csv | SinkKind::Both)
    }

    /// Whether the cache sink is enabled.
    pub fn includes_cache(self) -> bool {
        matches!(self, SinkKind::Cache | SinkKind::Both)
    }
}

impl FromStr for SinkKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(SinkKind::Csv),
            "cache" => Ok(SinkKind::Cache),
            "both" => Ok(SinkKind::Both),
            other => Err(Error::Config(format!(
                "unknown sink '{}' (expected csv, cache or both)",
                other
            ))),
        }
    }
}

/// Where the CSV pass keeps its watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ResumeKind {
    /// Bookmark record files.
    Bookmark,
    /// Recovered from the newest CSV artifact name.
    Artifact,
}

impl FromStr for ResumeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bookmark" => Ok(ResumeKind::Bookmark),
            "artifact" => Ok(ResumeKind::Artifact),
            other => Err(Error::Config(format!(
                "unknown resume backend '{}' (expected bookmark or artifact)",
                other
            ))),
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Directory of JSONL trace files.
    pub input_dir: PathBuf,

    /// Output directory for CSV artifacts.
    pub output_dir: PathBuf,

    /// Directory for bookmark records.
    pub bookmark_dir: PathBuf,

    /// Directory for buffered cache files.
    pub cache_dir: PathBuf,

    /// Enabled sinks.
    pub sink: SinkKind,

    /// Watermark backend for the CSV sink.
    pub resume: ResumeKind,

    /// Filter rules, empty to include everything.
    pub filter: String,

    /// Delay between passes.
    pub interval: Duration,

    /// Metrics HTTP port, 0 to disable.
    pub metrics_port: u16,

    /// Gzip CSV artifacts when supported.
    pub compress: bool,

    /// Age after which cache files are no longer delivered.
    pub cache_retention: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("./traces"),
            output_dir: PathBuf::from("./output"),
            bookmark_dir: PathBuf::from("./bookmarks"),
            cache_dir: PathBuf::from("./cache"),
            sink: SinkKind::Csv,
            resume: ResumeKind::Bookmark,
            filter: String::new(),
            interval: Duration::from_secs(60),
            metrics_port: 9090,
            compress: true,
            cache_retention: Duration::from_secs(72 * 3600),
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional:
    /// - `TRACESIEVE_INPUT_DIR` (default: "./traces")
    /// - `TRACESIEVE_OUTPUT_DIR` (default: "./output")
    /// - `TRACESIEVE_BOOKMARK_DIR` (default: "./bookmarks")
    /// - `TRACESIEVE_CACHE_DIR` (default: "./cache")
    /// - `TRACESIEVE_SINK`: csv, cache or both (default: csv)
    /// - `TRACESIEVE_RESUME`: bookmark or artifact (default: bookmark)
    /// - `TRACESIEVE_FILTER`: filter rules (default: include everything)
    /// - `TRACESIEVE_INTERVAL_SECS` (default: 60)
    /// - `TRACESIEVE_METRICS_PORT` (default: 9090)
    /// - `TRACESIEVE_COMPRESS`: true/false (default: true)
    /// - `TRACESIEVE_CACHE_RETENTION_HOURS` (default: 72)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let interval_secs: u64 = parse_var("TRACESIEVE_INTERVAL_SECS")?
            .unwrap_or(defaults.interval.as_secs());
        if interval_secs == 0 {
            return Err(Error::Config(
                "TRACESIEVE_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }

        let cache_retention = match parse_var::<u64>("TRACESIEVE_CACHE_RETENTION_HOURS")? {
            Some(hours) => hours
                .checked_mul(3600)
                .map(Duration::from_secs)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "TRACESIEVE_CACHE_RETENTION_HOURS={hours} is too large"
                    ))
                })?,
            None => defaults.cache_retention,
        };

        let config = Self {
            input_dir: path_var("TRACESIEVE_INPUT_DIR").unwrap_or(defaults.input_dir),
            output_dir: path_var("TRACESIEVE_OUTPUT_DIR").unwrap_or(defaults.output_dir),
            bookmark_dir: path_var("TRACESIEVE_BOOKMARK_DIR").unwrap_or(defaults.bookmark_dir),
            cache_dir: path_var("TRACESIEVE_CACHE_DIR").unwrap_or(defaults.cache_dir),
            sink: parse_var("TRACESIEVE_SINK")?.unwrap_or(defaults.sink),
            resume: parse_var("TRACESIEVE_RESUME")?.unwrap_or(defaults.resume),
            filter: std::env::var("TRACESIEVE_FILTER").unwrap_or(defaults.filter),
            interval: Duration::from_secs(interval_secs),
            metrics_port: parse_var("TRACESIEVE_METRICS_PORT")?.unwrap_or(defaults.metrics_port),
            compress: parse_bool_var("TRACESIEVE_COMPRESS")?.unwrap_or(defaults.compress),
            cache_retention,
        };

        tracing::debug!(
            input_dir = %config.input_dir.display(),
            output_dir = %config.output_dir.display(),
            sink = ?config.sink,
            resume = ?config.resume,
            "agent configuration loaded"
        );

        Ok(config)
    }
}

fn path_var(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn parse_var<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}='{}': {}", key, value, e))),
        _ => Ok(None),
    }
}

fn parse_bool_var(key: &str) -> Result<Option<bool>> {
    match std::env::var(key) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(Error::Config(format!(
                "{}='{}': expected true or false",
                key, value
            ))),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize config tests that manipulate env vars.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "TRACESIEVE_INPUT_DIR",
        "TRACESIEVE_OUTPUT_DIR",
        "TRACESIEVE_BOOKMARK_DIR",
        "TRACESIEVE_CACHE_DIR",
        "TRACESIEVE_SINK",
        "TRACESIEVE_RESUME",
        "TRACESIEVE_FILTER",
        "TRACESIEVE_INTERVAL_SECS",
        "TRACESIEVE_METRICS_PORT",
        "TRACESIEVE_COMPRESS",
        "TRACESIEVE_CACHE_RETENTION_HOURS",
    ];

    /// Run `f` with only `vars` set among the agent's env vars.
    fn with_env_vars<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let _guard = ENV_MUTEX.lock().unwrap();

        let saved: Vec<_> = ENV_KEYS
            .iter()
            .map(|k| (*k, std::env::var(k).ok()))
            .collect();

        // SAFETY: Serialized by mutex; only test code touches these vars.
        unsafe {
            for k in ENV_KEYS {
                std::env::remove_var(k);
            }
            for (k, v) in vars {
                std::env::set_var(k, v);
            }
        }

        f();

        // SAFETY: Restoring original env state.
        unsafe {
            for (k, v) in &saved {
                match v {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }
    }

    #[test]
    fn config_defaults() {
        with_env_vars(&[], || {
            let config = AgentConfig::from_env().unwrap();
            assert_eq!(config.input_dir, PathBuf::from("./traces"));
            assert_eq!(config.output_dir, PathBuf::from("./output"));
            assert_eq!(config.bookmark_dir, PathBuf::from("./bookmarks"));
            assert_eq!(config.sink, SinkKind::Csv);
            assert_eq!(config.resume, ResumeKind::Bookmark);
            assert!(config.filter.is_empty());
            assert_eq!(config.interval, Duration::from_secs(60));
            assert_eq!(config.metrics_port, 9090);
            assert!(config.compress);
            assert_eq!(config.cache_retention, Duration::from_secs(72 * 3600));
        });
    }

    #[test]
    fn config_custom_values() {
        with_env_vars(
            &[
                ("TRACESIEVE_INPUT_DIR", "/var/traces"),
                ("TRACESIEVE_SINK", "Both"),
                ("TRACESIEVE_RESUME", "artifact"),
                ("TRACESIEVE_FILTER", "_summary_"),
                ("TRACESIEVE_INTERVAL_SECS", "5"),
                ("TRACESIEVE_METRICS_PORT", "0"),
                ("TRACESIEVE_COMPRESS", "off"),
                ("TRACESIEVE_CACHE_RETENTION_HOURS", "1"),
            ],
            || {
                let config = AgentConfig::from_env().unwrap();
                assert_eq!(config.input_dir, PathBuf::from("/var/traces"));
                assert_eq!(config.sink, SinkKind::Both);
                assert!(config.sink.includes_csv());
                assert!(config.sink.includes_cache());
                assert_eq!(config.resume, ResumeKind::Artifact);
                assert_eq!(config.filter, "_summary_");
                assert_eq!(config.interval, Duration::from_secs(5));
                assert_eq!(config.metrics_port, 0);
                assert!(!config.compress);
                assert_eq!(config.cache_retention, Duration::from_secs(3600));
            },
        );
    }

    #[test]
    fn config_rejects_bad_values() {
        with_env_vars(&[("TRACESIEVE_SINK", "kafka")], || {
            let err = AgentConfig::from_env().unwrap_err();
            assert!(matches!(err, Error::Config(_)));
            assert!(err.to_string().contains("kafka"));
        });

        with_env_vars(&[("TRACESIEVE_METRICS_PORT", "99999")], || {
            let err = AgentConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("TRACESIEVE_METRICS_PORT"));
        });

        with_env_vars(&[("TRACESIEVE_INTERVAL_SECS", "0")], || {
            assert!(AgentConfig::from_env().is_err());
        });

        with_env_vars(&[("TRACESIEVE_COMPRESS", "maybe")], || {
            assert!(AgentConfig::from_env().is_err());
        });

        with_env_vars(
            &[("TRACESIEVE_CACHE_RETENTION_HOURS", "18446744073709551615")],
            || {
                let err = AgentConfig::from_env().unwrap_err();
                assert!(matches!(err, Error::Config(_)));
                assert!(err.to_string().contains("too large"));
            },
        );
    }

    #[test]
    fn sink_kind_selection() {
        assert!(SinkKind::Csv.includes_csv());
        assert!(!SinkKind::Csv.includes_cache());
        assert!(SinkKind::Cache.includes_cache());
        assert!(!SinkKind::Cache.includes_csv());
    }
}
