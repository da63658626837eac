//! Relational persistence of streams and their records.
//!
//! The [`RecordStore`] owns a small pool of SQLite connections. Every
//! operation checks out one connection for its duration, so the pool size is
//! the store's concurrency budget and the natural size of the writer pool.
//!
//! # Semantics
//!
//! - Streams are created lazily and never mutated.
//! - Records are keyed by `(stream, start_time)`; writing the same key again
//!   replaces the stored bytes.
//! - Retention deletes records by start time and is independent of any cache.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info};

use crate::mseed::RecordHeader;
use crate::schema;
use crate::stream::{RecordKey, StreamId, StreamPattern, TimeWindow};
use crate::{Error, Result};

/// Configuration for the record store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
    /// Number of pooled connections (maximum concurrent operations).
    pub max_connections: usize,
    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout: Duration,
    /// How long an operation waits for a free pooled connection.
    pub checkout_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/nrt.db"),
            max_connections: 10,
            busy_timeout: Duration::from_secs(5),
            checkout_timeout: Duration::from_secs(30),
        }
    }
}

/// Opaque reference to a stored stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamRef(i64);

/// Latency measurements captured when a record is written, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Latency {
    /// From the record's start time to its receipt from upstream.
    pub transmission: f64,
    /// From the record's start time to its persistence.
    pub persistence: f64,
}

impl Latency {
    /// Measure latencies of a record starting at `start`, received at
    /// `received_at` and persisted now.
    pub fn measure(start: DateTime<Utc>, received_at: DateTime<Utc>) -> Self {
        Self {
            transmission: seconds_between(start, received_at),
            persistence: seconds_between(start, Utc::now()),
        }
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_microseconds().unwrap_or(i64::MAX) as f64 / 1e6
}

/// A record ready to be written.
#[derive(Debug, Clone, Copy)]
pub struct NewRecord<'a> {
    pub start: DateTime<Utc>,
    /// End of the covered interval (exclusive).
    pub end: DateTime<Utc>,
    /// The complete fixed-length record, header included.
    pub raw: &'a [u8],
    pub latency: Latency,
}

impl<'a> NewRecord<'a> {
    pub fn from_header(header: &RecordHeader, raw: &'a [u8], latency: Latency) -> Self {
        Self {
            start: header.start,
            end: header.end(),
            raw,
            latency,
        }
    }
}

/// Row counts for startup logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub streams: u64,
    pub records: u64,
}

/// SQLite-backed stream and record store.
///
/// Thread-safe: share it across workers via `Arc<RecordStore>`.
pub struct RecordStore {
    config: StoreConfig,
    pool: Pool<SqliteConnectionManager>,
}

impl RecordStore {
    /// Open or create a store with the given configuration.
    pub fn open(config: StoreConfig) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }

        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Unavailable(format!("failed to create {}: {e}", parent.display()))
                })?;
            }
        }

        let busy_timeout = config.busy_timeout;
        let manager = SqliteConnectionManager::file(&config.path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch(
                "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
            )
        });
        let pool = build_pool(manager, &config)?;
        schema::init_schema(&*pool.get()?)?;

        info!(
            path = %config.path.display(),
            connections = config.max_connections,
            "record store opened"
        );

        Ok(Self { config, pool })
    }

    /// Open a single-connection in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let config = StoreConfig {
            path: PathBuf::from(":memory:"),
            max_connections: 1,
            ..Default::default()
        };

        // Every in-memory connection is its own database, so the pool holds
        // exactly one and never recycles it.
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys=ON;"));
        let pool = build_pool(manager, &config)?;
        schema::init_schema(&*pool.get()?)?;

        Ok(Self { config, pool })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Maximum number of concurrent store operations.
    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }

    fn checkout(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| {
            Error::Unavailable(format!(
                "no store connection free after {:?}: {e}",
                self.config.checkout_timeout
            ))
        })
    }

    /// Return the stream's reference, creating the stream if needed.
    pub fn ensure_stream(&self, stream: &StreamId) -> Result<StreamRef> {
        let conn = self.checkout()?;
        ensure_stream(&conn, stream)
    }

    /// Insert or replace one record of an existing stream.
    pub fn put_record(&self, stream: StreamRef, record: &NewRecord<'_>) -> Result<()> {
        let conn = self.checkout()?;
        put_record(&conn, stream, record)
    }

    /// Ensure the stream and upsert the record in one transaction.
    pub fn save_record(&self, stream: &StreamId, record: &NewRecord<'_>) -> Result<()> {
        let mut conn = self.checkout()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stream_ref = ensure_stream(&tx, stream)?;
        put_record(&tx, stream_ref, record)?;
        tx.commit()?;
        Ok(())
    }

    /// Latest record start time across all streams, `None` when empty.
    pub fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.checkout()?;
        let latest: Option<i64> =
            conn.query_row("SELECT MAX(start_time) FROM record", [], |row| row.get(0))?;
        latest.map(from_micros).transpose()
    }

    /// Fetch the raw bytes of one record.
    pub fn get_record(&self, stream: &StreamId, start: DateTime<Utc>) -> Result<Bytes> {
        let conn = self.checkout()?;
        let mut stmt = conn.prepare_cached(
            "SELECT r.raw FROM record r
             JOIN stream s ON s.stream_pk = r.stream_pk
             WHERE s.network = ?1 AND s.station = ?2 AND s.channel = ?3 AND s.location = ?4
             AND r.start_time = ?5",
        )?;

        let raw: Option<Vec<u8>> = stmt
            .query_row(
                params![
                    stream.network,
                    stream.station,
                    stream.channel,
                    stream.location,
                    start.timestamp_micros()
                ],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(Bytes::from).ok_or_else(|| {
            Error::NotFound(RecordKey::new(stream.clone(), start).to_string())
        })
    }

    /// Fetch the raw bytes of the record named by `key`.
    pub fn get_record_by_key(&self, key: &RecordKey) -> Result<Bytes> {
        self.get_record(key.stream(), key.start())
    }

    /// Keys of records in streams matching `pattern` whose interval
    /// `[start, end)` intersects `window`, ordered by start time.
    pub fn search_holdings(
        &self,
        pattern: &StreamPattern,
        window: &TimeWindow,
    ) -> Result<Vec<RecordKey>> {
        let conn = self.checkout()?;

        let streams = load_streams(&conn)?;
        let matching: Vec<(i64, StreamId)> = streams
            .into_iter()
            .filter(|(_, id)| pattern.matches(id))
            .collect();

        let mut stmt = conn.prepare_cached(
            "SELECT start_time FROM record
             WHERE stream_pk = ?1 AND start_time < ?2 AND end_time > ?3
             ORDER BY start_time",
        )?;

        let mut keys = Vec::new();
        for (pk, id) in matching {
            let starts = stmt
                .query_map(
                    params![
                        pk,
                        window.end().timestamp_micros(),
                        window.start().timestamp_micros()
                    ],
                    |row| row.get::<_, i64>(0),
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for start in starts {
                keys.push(RecordKey::new(id.clone(), from_micros(start)?));
            }
        }

        keys.sort_by(|a, b| {
            a.start()
                .cmp(&b.start())
                .then_with(|| a.stream().cmp(b.stream()))
        });

        debug!(
            keys = keys.len(),
            start = %window.start(),
            end = %window.end(),
            "holdings search"
        );

        Ok(keys)
    }

    /// Delete records that started more than `horizon` ago.
    pub fn expire_older_than(&self, horizon: Duration) -> Result<usize> {
        let horizon = TimeDelta::from_std(horizon)
            .map_err(|e| Error::Config(format!("retention horizon out of range: {e}")))?;
        let cutoff = Utc::now()
            .checked_sub_signed(horizon)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.expire_before(cutoff)
    }

    /// Delete records that started before `cutoff`.
    pub fn expire_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.checkout()?;
        let deleted = conn.execute(
            "DELETE FROM record WHERE start_time < ?1",
            [cutoff.timestamp_micros()],
        )?;
        Ok(deleted)
    }

    /// Delete a stream and all of its records. Returns the number of records
    /// removed; a missing stream is not an error.
    pub fn reset_stream(&self, stream: &StreamId) -> Result<usize> {
        let mut conn = self.checkout()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let pk: Option<i64> = tx
            .query_row(
                "SELECT stream_pk FROM stream
                 WHERE network = ?1 AND station = ?2 AND channel = ?3 AND location = ?4",
                params![
                    stream.network,
                    stream.station,
                    stream.channel,
                    stream.location
                ],
                |row| row.get(0),
            )
            .optional()?;

        let Some(pk) = pk else {
            return Ok(0);
        };

        let deleted = tx.execute("DELETE FROM record WHERE stream_pk = ?1", [pk])?;
        tx.execute("DELETE FROM stream WHERE stream_pk = ?1", [pk])?;
        tx.commit()?;

        info!(stream = %stream, records = deleted, "stream reset");
        Ok(deleted)
    }

    /// All known streams, ordered by identity.
    pub fn streams(&self) -> Result<Vec<StreamId>> {
        let conn = self.checkout()?;
        let mut streams: Vec<StreamId> = load_streams(&conn)?
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        streams.sort();
        Ok(streams)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.checkout()?;
        let streams: i64 = conn.query_row("SELECT COUNT(*) FROM stream", [], |row| row.get(0))?;
        let records: i64 = conn.query_row("SELECT COUNT(*) FROM record", [], |row| row.get(0))?;
        Ok(StoreStats {
            streams: streams as u64,
            records: records as u64,
        })
    }
}

/// Fixed-size pool: connections are opened up front and kept for the life of
/// the store.
fn build_pool(
    manager: SqliteConnectionManager,
    config: &StoreConfig,
) -> Result<Pool<SqliteConnectionManager>> {
    let size = u32::try_from(config.max_connections)
        .map_err(|_| Error::Config(format!("max_connections {} too large", config.max_connections)))?;
    let pool = Pool::builder()
        .max_size(size)
        .min_idle(Some(size))
        .idle_timeout(None)
        .max_lifetime(None)
        .connection_timeout(config.checkout_timeout.max(Duration::from_millis(1)))
        .build(manager)?;
    Ok(pool)
}

fn ensure_stream(conn: &Connection, stream: &StreamId) -> Result<StreamRef> {
    conn.prepare_cached(
        "INSERT INTO stream (network, station, channel, location)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (network, station, channel, location) DO NOTHING",
    )?
    .execute(params![
        stream.network,
        stream.station,
        stream.channel,
        stream.location
    ])?;

    let pk: i64 = conn
        .prepare_cached(
            "SELECT stream_pk FROM stream
             WHERE network = ?1 AND station = ?2 AND channel = ?3 AND location = ?4",
        )?
        .query_row(
            params![
                stream.network,
                stream.station,
                stream.channel,
                stream.location
            ],
            |row| row.get(0),
        )?;

    Ok(StreamRef(pk))
}

fn put_record(conn: &Connection, stream: StreamRef, record: &NewRecord<'_>) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO record (stream_pk, start_time, end_time, latency_tx, latency_data, raw)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (stream_pk, start_time) DO UPDATE SET
            end_time = excluded.end_time,
            latency_tx = excluded.latency_tx,
            latency_data = excluded.latency_data,
            raw = excluded.raw",
    )?
    .execute(params![
        stream.0,
        record.start.timestamp_micros(),
        record.end.timestamp_micros(),
        record.latency.transmission,
        record.latency.persistence,
        record.raw
    ])?;
    Ok(())
}

fn load_streams(conn: &Connection) -> Result<Vec<(i64, StreamId)>> {
    let mut stmt = conn
        .prepare_cached("SELECT stream_pk, network, station, channel, location FROM stream")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                StreamId::new(
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ),
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::Unavailable(format!("stored timestamp {micros} out of range")))
}
