//! SeedLink ingestion pipeline.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Supervisor    │  resume point → SeedLink session → reconnect
//! └────────┬────────┘
//!          │ blocking push (backpressure)
//!          ▼
//! ┌─────────────────┐
//! │   RecordQueue   │  bounded FIFO of raw records
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   WriterPool    │  decode + save, one store connection each
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   RecordStore   │  SQLite, trimmed by the expiry task
//! └─────────────────┘
//! ```
//!
//! Nothing between the socket and the store drops a record on purpose: a
//! full queue stalls the receiver, and only records that fail to decode or
//! store are discarded (and counted).

pub mod error;
pub mod expiry;
pub mod observer;
pub mod queue;
pub mod resume;
pub mod seedlink;
pub mod supervisor;
pub mod writer;

pub use error::{Error, RecordError, Result};
pub use expiry::{ExpiryConfig, ExpiryTask};
pub use observer::{CountingObserver, IngestObserver, MetricsObserver};
pub use queue::{QueueConfig, QueueReceiver, QueueSender, ReceivedRecord, record_queue};
pub use resume::{ResumeConfig, ResumeTracker, TimestampSource};
pub use seedlink::{SeedLink, SessionState, SlinkConfig};
pub use supervisor::{ReconnectPolicy, Supervisor, SupervisorStats};
pub use writer::{RecordSink, WriterPool, WriterStats};
