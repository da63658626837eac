//! SQLite schema for the stream and record tables.
//!
//! ```text
//! stream (stream_pk, network, station, channel, location)   unique identity
//! record (stream_pk, start_time, end_time, latency_tx, latency_data, raw)
//! ```
//!
//! Times are stored as integer microseconds since the Unix epoch. The record
//! primary key `(stream_pk, start_time)` makes re-ingest an overwrite, and the
//! `(stream_pk, end_time)` index serves the holdings overlap query.

use rusqlite::Connection;

use crate::{Error, Result};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
///
/// Creates all tables if they don't exist. Refuses to open a database written
/// by a newer schema.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(Error::Config(format!(
            "database schema version {current_version} is newer than supported version {SCHEMA_VERSION}"
        )));
    }

    Ok(())
}

/// Get the current schema version (0 if not initialized).
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS stream (
            stream_pk INTEGER PRIMARY KEY AUTOINCREMENT,
            network TEXT NOT NULL,
            station TEXT NOT NULL,
            channel TEXT NOT NULL,
            location TEXT NOT NULL,
            UNIQUE (network, station, channel, location)
        );

        CREATE TABLE IF NOT EXISTS record (
            stream_pk INTEGER NOT NULL REFERENCES stream (stream_pk) ON DELETE CASCADE,
            start_time INTEGER NOT NULL,
            end_time INTEGER NOT NULL,
            latency_tx REAL NOT NULL,
            latency_data REAL NOT NULL,
            raw BLOB NOT NULL,
            PRIMARY KEY (stream_pk, start_time)
        );

        CREATE INDEX IF NOT EXISTS idx_record_start ON record (start_time);
        CREATE INDEX IF NOT EXISTS idx_record_stream_end ON record (stream_pk, end_time);
        "#,
    )?;

    Ok(())
}
