//! Prometheus metrics helpers.
//!
//! # Usage
//!
//! ```rust,ignore
//! use nrt_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     metrics::counter!("ingest_packets_received_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`ingest_`, `writer_`, `store_`, `cache_`)
//! - Suffix: unit or type (`_total`, `_bytes`, `_seconds`)

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tracing::{error, info};

// Metric names shared by the ingest and read paths.
pub const PACKETS_RECEIVED: &str = "ingest_packets_received_total";
pub const SESSIONS_STARTED: &str = "ingest_sessions_started_total";
pub const SESSION_FAILURES: &str = "ingest_session_failures_total";
pub const QUEUE_DEPTH: &str = "ingest_queue_depth";
pub const RECORDS_SAVED: &str = "writer_records_saved_total";
pub const RECORDS_DROPPED: &str = "writer_records_dropped_total";
pub const LATENCY_TRANSMISSION: &str = "writer_latency_transmission_seconds";
pub const LATENCY_PERSISTENCE: &str = "writer_latency_persistence_seconds";
pub const RECORDS_EXPIRED: &str = "store_records_expired_total";
pub const CACHE_HITS: &str = "cache_hits_total";
pub const CACHE_LOADS: &str = "cache_loads_total";
pub const CACHE_LOAD_ERRORS: &str = "cache_load_errors_total";

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves `/metrics` on the given port from a background task and returns
/// once the listener is bound.
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
    info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

/// Register descriptions for all metrics.
fn register_common_metrics() {
    // =========================================================================
    // Receiver
    // =========================================================================

    describe_counter!(PACKETS_RECEIVED, "Data packets received from SeedLink");
    describe_counter!(SESSIONS_STARTED, "SeedLink sessions opened");
    describe_counter!(SESSION_FAILURES, "SeedLink sessions terminated by an error");
    describe_gauge!(QUEUE_DEPTH, "Records waiting in the ingest queue");

    // =========================================================================
    // Writer pool
    // =========================================================================

    describe_counter!(RECORDS_SAVED, "Records persisted to the store");
    describe_counter!(
        RECORDS_DROPPED,
        "Records dropped by a writer (label: reason)"
    );
    describe_histogram!(
        LATENCY_TRANSMISSION,
        "Seconds from record start time to receipt"
    );
    describe_histogram!(
        LATENCY_PERSISTENCE,
        "Seconds from record start time to persistence"
    );

    // =========================================================================
    // Store and cache
    // =========================================================================

    describe_counter!(RECORDS_EXPIRED, "Records deleted by retention");
    describe_counter!(CACHE_HITS, "Record cache hits");
    describe_counter!(CACHE_LOADS, "Record cache loads from the store");
    describe_counter!(CACHE_LOAD_ERRORS, "Record cache loads that failed");
}
