//! Core types, codec and storage for near-real-time waveform archiving.
//!
//! This crate provides:
//! - Fixed-length miniSEED header decoding and record building ([`mseed`])
//! - Stream identity, record keys and stream patterns ([`stream`])
//! - The SQLite-backed stream/record store ([`store`])
//! - Prometheus metrics helpers ([`metrics`])
//! - Shared error types

mod error;
pub mod metrics;
pub mod mseed;
mod schema;
pub mod store;
pub mod stream;

pub use error::{Error, Result};
pub use mseed::{ByteOrder, RECORD_LENGTH, RecordBuilder, RecordHeader};
pub use store::{Latency, NewRecord, RecordStore, StoreConfig, StoreStats, StreamRef};
pub use stream::{FieldMatch, RecordKey, StreamId, StreamPattern, TimeWindow};
