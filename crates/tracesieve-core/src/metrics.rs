//! Prometheus metrics helpers for tracesieve.
//!
//! This module provides centralized metrics initialization and the
//! descriptions of every metric emitted by tracesieve components.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tracesieve_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     metrics::counter!("batcher_events_submitted_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`batcher_`, `resume_`, `sink_`, `cache_`, `ingest_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: `source` and `sink` only, to keep cardinality bounded

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Returns a handle that can be used with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if the recorder is already installed,
/// instead of panicking.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves the `/metrics` endpoint on the specified port. The listener is bound
/// before this returns, so a port conflict is reported to the caller; serving
/// happens on a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for all tracesieve metrics.
fn register_metrics() {
    // =========================================================================
    // Batcher
    // =========================================================================

    describe_counter!(
        "batcher_events_submitted_total",
        "Events submitted to the batcher by a segment reader"
    );
    describe_counter!(
        "batcher_events_duplicate_total",
        "Flushed events suppressed because a previous pass already delivered them"
    );
    describe_counter!(
        "batcher_events_excluded_total",
        "Flushed events rejected by the inclusion filter"
    );
    describe_counter!(
        "batcher_events_delivered_total",
        "Events handed to a sink"
    );
    describe_counter!(
        "batcher_batches_discarded_total",
        "Trailing batches of active segments discarded for re-reading next pass"
    );
    describe_counter!(
        "batcher_segments_failed_total",
        "Segments whose sink failed; the watermark was not advanced"
    );

    // =========================================================================
    // Resumption watermarks
    // =========================================================================

    describe_counter!(
        "resume_watermark_advances_total",
        "Watermark updates persisted after a sink accepted a segment"
    );
    describe_counter!(
        "resume_cold_starts_total",
        "Watermark lookups that fell back to the minimum (missing or corrupt record)"
    );
    describe_counter!(
        "resume_io_failures_total",
        "Bookmark reads or writes that failed after exhausting retries"
    );

    // =========================================================================
    // Sinks
    // =========================================================================

    describe_counter!(
        "sink_events_written_total",
        "Events written by file-backed sinks"
    );
    describe_counter!(
        "sink_artifacts_sealed_total",
        "Output files renamed into place by file-backed sinks"
    );
    describe_counter!(
        "cache_events_delivered_total",
        "Buffered events delivered to the cache consumer"
    );
    describe_counter!(
        "cache_files_deleted_total",
        "Buffered event files deleted after delivery or expiry"
    );

    // =========================================================================
    // Passes
    // =========================================================================

    describe_counter!("ingest_passes_total", "Read passes started");
    describe_counter!(
        "ingest_passes_failed_total",
        "Read passes that ended with an error and will be retried"
    );
    describe_histogram!(
        "ingest_pass_duration_seconds",
        "Wall time of one read pass"
    );
    describe_gauge!(
        "ingest_running",
        "Whether the ingestion daemon is running (1=yes, 0=no)"
    );
}
