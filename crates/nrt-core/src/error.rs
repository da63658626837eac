//! Error types shared by the ingest and read paths.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding, storing or serving records.
#[derive(Error, Debug)]
pub enum Error {
    /// The buffer is not a structurally valid fixed-length record.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// The requested record (or stream) does not exist in the store.
    #[error("not found: {0}")]
    NotFound(String),

    /// The store could not be reached or failed to execute a statement.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A SeedLink session failed and must be re-established.
    #[error("session failure: {0}")]
    SessionFailure(String),

    /// A record key could not be parsed back into stream identity and time.
    #[error("invalid record key '{key}': {reason}")]
    InvalidKey {
        /// The offending key.
        key: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A stream field pattern failed to compile.
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The pattern as supplied.
        pattern: String,
        /// Compiler message.
        reason: String,
    },

    /// A search window whose end precedes its start.
    #[error("invalid time window: start {start} is after end {end}")]
    InvalidWindow {
        /// Window start.
        start: DateTime<Utc>,
        /// Window end.
        end: DateTime<Utc>,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for errors that mean "the record does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True for errors caused by the store being unreachable or failing.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Rebuild an owned error from a shared one.
    ///
    /// The read cache hands the same failure to every caller waiting on a
    /// single load. `NotFound` keeps its identity; anything else is reported
    /// as `Unavailable` carrying the original message.
    pub fn from_shared(err: &Error) -> Self {
        match err {
            Self::NotFound(what) => Self::NotFound(what.clone()),
            Self::MalformedRecord(msg) => Self::MalformedRecord(msg.clone()),
            Self::InvalidKey { key, reason } => Self::InvalidKey {
                key: key.clone(),
                reason: reason.clone(),
            },
            Self::Unavailable(msg) => Self::Unavailable(msg.clone()),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("no matching row".to_string()),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

impl From<r2d2::Error> for Error {
    fn from(err: r2d2::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}
