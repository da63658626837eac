//! Bounded ingest queue between the SeedLink receiver and the writer pool.
//!
//! The queue is the only flow control in the pipeline. When it is full,
//! [`QueueSender::push`] blocks the receiver, which stops reading from the
//! socket and lets TCP push back on the upstream server. Nothing is ever
//! dropped by the queue itself.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::{Error, Result};

/// Configuration for the ingest queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of records held.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        // ~10-12 minutes of a national network's records.
        Self { capacity: 200_000 }
    }
}

impl QueueConfig {
    /// Size the queue to absorb `headroom` of a downstream stall at
    /// `records_per_second`.
    pub fn for_headroom(records_per_second: f64, headroom: Duration) -> Self {
        let capacity = (records_per_second.max(0.0) * headroom.as_secs_f64()).ceil() as usize;
        Self {
            capacity: capacity.max(1),
        }
    }
}

/// A raw record as received from upstream.
#[derive(Debug, Clone)]
pub struct ReceivedRecord {
    /// SeedLink packet sequence number.
    pub sequence: u32,
    /// The fixed-length record bytes.
    pub raw: Bytes,
    /// When the packet was read off the wire.
    pub received_at: DateTime<Utc>,
}

/// Create a bounded queue with the given configuration.
pub fn record_queue(config: &QueueConfig) -> (QueueSender, QueueReceiver) {
    let capacity = config.capacity.max(1);
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (
        QueueSender { tx, capacity },
        QueueReceiver { rx },
    )
}

/// Producer side, held by the receiver.
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: Sender<ReceivedRecord>,
    capacity: usize,
}

impl QueueSender {
    /// Enqueue a record, blocking while the queue is full.
    ///
    /// Fails only when every consumer has been dropped.
    pub fn push(&self, record: ReceivedRecord) -> Result<()> {
        self.tx.send(record).map_err(|_| Error::QueueClosed)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Consumer side, cloned into each writer.
#[derive(Debug, Clone)]
pub struct QueueReceiver {
    rx: Receiver<ReceivedRecord>,
}

impl QueueReceiver {
    /// Dequeue the oldest record, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is empty and every sender is gone.
    pub fn pop(&self) -> Option<ReceivedRecord> {
        self.rx.recv().ok()
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<ReceivedRecord>> {
        match self.rx.recv_timeout(timeout) {
            Ok(record) => Ok(Some(record)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::QueueClosed),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
