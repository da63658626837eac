//! Near-real-time SeedLink ingestion daemon.
//!
//! Connects to a SeedLink server, streams fixed-length records into the
//! record store and trims the store to the retention window.
//!
//! # Usage
//!
//! ```bash
//! # Everything from a local server
//! nrt-ingest
//!
//! # One network, custom store
//! nrt-ingest --server link.geonet.org.nz --streams 'NZ_*' --db-path /data/nrt.db
//! ```
//!
//! # Graceful Shutdown
//!
//! On SIGINT/SIGTERM the daemon:
//! 1. Ends the current SeedLink session
//! 2. Lets the writers drain everything already queued
//! 3. Stops the expiry task and exits
//!
//! If every writer has exited the receive loop aborts and the daemon exits
//! non-zero after draining.

use anyhow::{Context, Result};
use clap::Parser;
use metrics::gauge;
use nrt_core::metrics::{init_metrics, start_metrics_server};
use nrt_core::{RecordStore, StoreConfig};
use nrt_ingest::seedlink::parse_streams;
use nrt_ingest::{
    ExpiryConfig, ExpiryTask, IngestObserver, MetricsObserver, QueueConfig, ReconnectPolicy,
    ResumeConfig, ResumeTracker, SlinkConfig, Supervisor, WriterPool, record_queue,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Near-real-time SeedLink ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "nrt-ingest")]
#[command(about = "Stream SeedLink records into the near-real-time store")]
#[command(version)]
struct Args {
    /// SeedLink server, host or host:port
    #[arg(long, env = "SLINK_HOST", default_value = "localhost:18000")]
    server: String,

    /// Stream list, comma separated NET_STA[:SELECTORS]
    #[arg(long, env = "SLINK_STREAMS", default_value = "*_*")]
    streams: String,

    /// Selectors applied to every station
    #[arg(long, env = "SLINK_SELECTORS")]
    selectors: Option<String>,

    /// Seconds without any data before a session is considered hung
    #[arg(long, env = "SLINK_NET_TIMEOUT", default_value = "60")]
    net_timeout: u64,

    /// Seconds of silence before sending a keepalive (0 to disable)
    #[arg(long, env = "SLINK_KEEPALIVE", default_value = "1")]
    keepalive: u64,

    /// Never resume further back than this many seconds
    #[arg(long, env = "NRT_MAX_LOOKBACK", default_value = "600")]
    max_lookback: u64,

    /// SQLite database path
    #[arg(long, env = "NRT_DB_PATH", default_value = "./data/nrt.db")]
    db_path: PathBuf,

    /// Store connections, also the number of writers
    #[arg(long, env = "NRT_DB_MAX_CONNECTIONS", default_value = "10")]
    db_max_connections: usize,

    /// Ingest queue capacity in records
    #[arg(long, env = "NRT_QUEUE_CAPACITY", default_value = "200000")]
    queue_capacity: usize,

    /// Hours of data kept in the store
    #[arg(long, env = "NRT_RETENTION_HOURS", default_value = "48")]
    retention_hours: u64,

    /// Seconds between retention passes
    #[arg(long, env = "NRT_EXPIRE_INTERVAL", default_value = "60")]
    expire_interval: u64,

    /// First reconnect delay in milliseconds (0 to reconnect immediately)
    #[arg(long, env = "SLINK_RECONNECT_DELAY_MS", default_value = "250")]
    reconnect_delay_ms: u64,

    /// Longest reconnect delay in milliseconds
    #[arg(long, env = "SLINK_RECONNECT_DELAY_MAX_MS", default_value = "30000")]
    reconnect_delay_max_ms: u64,

    /// Record length in bytes
    #[arg(long, env = "NRT_RECORD_LENGTH", default_value = "512")]
    record_length: usize,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "NRT_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,
}

impl Args {
    fn reconnect_policy(&self) -> ReconnectPolicy {
        if self.reconnect_delay_ms == 0 {
            ReconnectPolicy::Immediate
        } else {
            ReconnectPolicy::Backoff {
                initial: Duration::from_millis(self.reconnect_delay_ms),
                max: Duration::from_millis(self.reconnect_delay_max_ms.max(self.reconnect_delay_ms)),
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("nrt_ingest=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    info!("nrt-ingest starting...");

    // Reject a bad stream list before touching anything else.
    parse_streams(&args.streams).context("Invalid --streams")?;

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
        gauge!("ingestion_running").set(1.0);
    }

    // A store that cannot be opened is fatal: exit non-zero.
    let store = Arc::new(
        RecordStore::open(StoreConfig {
            path: args.db_path.clone(),
            max_connections: args.db_max_connections,
            ..Default::default()
        })
        .with_context(|| format!("Failed to open record store at {:?}", args.db_path))?,
    );
    let store_stats = store.stats().context("Failed to read record store")?;
    info!(
        streams = store_stats.streams,
        records = store_stats.records,
        "record store opened"
    );

    let observer: Arc<dyn IngestObserver> = Arc::new(MetricsObserver);

    // Queue and writers
    let (queue_tx, queue_rx) = record_queue(&QueueConfig {
        capacity: args.queue_capacity,
    });
    let writers = WriterPool::start(
        store.max_connections(),
        queue_rx,
        store.clone(),
        Arc::clone(&observer),
        args.record_length,
    )
    .context("Failed to start writer pool")?;

    // Retention
    let expiry = ExpiryTask::start(
        store.clone(),
        ExpiryConfig {
            retention: Duration::from_secs(args.retention_hours * 3600),
            interval: Duration::from_secs(args.expire_interval.max(1)),
        },
        Arc::clone(&observer),
    )
    .context("Failed to start expiry task")?;

    let slink = SlinkConfig {
        server: args.server.clone(),
        net_timeout: Duration::from_secs(args.net_timeout),
        keepalive: Duration::from_secs(args.keepalive),
        streams: args.streams.clone(),
        selectors: args.selectors.clone(),
        start: None,
        record_length: args.record_length,
    };

    info!("Configuration:");
    info!("  Server: {}", slink.address());
    info!("  Streams: {}", slink.streams);
    info!("  Store: {}", args.db_path.display());
    info!("  Writers: {}", writers.workers());
    info!("  Queue capacity: {}", args.queue_capacity);
    info!("  Retention: {}h", args.retention_hours);

    let resume = ResumeTracker::new(
        store.clone(),
        ResumeConfig {
            max_lookback: Duration::from_secs(args.max_lookback),
        },
    );
    let supervisor = Supervisor::new(slink, resume, queue_tx, Arc::clone(&observer))
        .with_policy(args.reconnect_policy());

    let running = supervisor.running_flag();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received, stopping gracefully...");
        running.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    info!("listening for packets from SeedLink");
    let receive = tokio::task::spawn_blocking(move || supervisor.run())
        .await
        .context("Receive loop panicked")?;

    // The supervisor dropped its sender: writers drain the queue and exit.
    info!("Draining ingest queue...");
    let writer_stats = writers.join();
    expiry.stop();

    gauge!("ingestion_running").set(0.0);

    // Nothing can be stored any more; exit non-zero so the process is restarted.
    let receive_stats = match receive {
        Ok(stats) => stats,
        Err(e) => {
            error!(
                saved = writer_stats.saved,
                dropped = writer_stats.dropped,
                "receive loop aborted: {e}"
            );
            return Err(e).context("Ingestion stopped");
        }
    };

    info!("═══════════════════════════════════════════════════════");
    info!("SHUTDOWN COMPLETE");
    info!("═══════════════════════════════════════════════════════");
    info!("Sessions:          {}", receive_stats.sessions);
    info!("Session failures:  {}", receive_stats.failures);
    info!("Packets received:  {}", receive_stats.packets);
    info!("Records saved:     {}", writer_stats.saved);
    info!("Records dropped:   {}", writer_stats.dropped);

    Ok(())
}
