//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the ingestion pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Error from the shared core (store, codec, session).
    #[error(transparent)]
    Core(#[from] nrt_core::Error),

    /// I/O error (thread spawn, file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every queue consumer has gone away.
    #[error("ingest queue closed")]
    QueueClosed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Why a single dequeued record was not persisted.
///
/// Per-record failures never stop a writer; they are logged, counted and the
/// record is dropped.
#[derive(Error, Debug)]
pub enum RecordError {
    /// The payload is not a valid fixed-length record.
    #[error("undecodable record: {0}")]
    Decode(#[source] nrt_core::Error),

    /// The store rejected or could not take the write.
    #[error("failed to store {key}: {source}")]
    Store {
        /// Record key of the dropped record.
        key: String,
        #[source]
        source: nrt_core::Error,
    },
}

impl RecordError {
    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Decode(_) => "malformed",
            Self::Store { .. } => "store",
        }
    }
}
