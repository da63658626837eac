//! Writer pool draining the ingest queue into the store.
//!
//! Each writer decodes one dequeued record, measures its latencies and saves
//! it. A record that fails is logged, counted and dropped; the writer moves on
//! to the next one. Writers exit once the queue is closed and drained.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nrt_core::{Latency, NewRecord, RecordStore, StreamId, mseed};
use tracing::{debug, error, info, warn};

use crate::error::RecordError;
use crate::observer::IngestObserver;
use crate::queue::{QueueReceiver, ReceivedRecord};
use crate::Result;

/// Destination for decoded records.
pub trait RecordSink: Send + Sync {
    /// Persist one record, creating its stream on first sight.
    fn save(&self, stream: &StreamId, record: &NewRecord<'_>) -> nrt_core::Result<()>;
}

impl RecordSink for RecordStore {
    fn save(&self, stream: &StreamId, record: &NewRecord<'_>) -> nrt_core::Result<()> {
        self.save_record(stream, record)
    }
}

/// Decode and persist a single received record.
pub fn persist(
    sink: &dyn RecordSink,
    item: &ReceivedRecord,
    record_length: usize,
) -> std::result::Result<Latency, RecordError> {
    let header = mseed::decode_with_length(&item.raw, record_length).map_err(RecordError::Decode)?;
    let latency = Latency::measure(header.start, item.received_at);

    sink.save(&header.stream, &NewRecord::from_header(&header, &item.raw, latency))
        .map_err(|source| RecordError::Store {
            key: header.key().to_string(),
            source,
        })?;

    Ok(latency)
}

/// Totals reported by the writers when they exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub saved: u64,
    pub dropped: u64,
}

impl std::ops::AddAssign for WriterStats {
    fn add_assign(&mut self, other: Self) {
        self.saved += other.saved;
        self.dropped += other.dropped;
    }
}

/// A fixed set of writer threads sharing one queue.
pub struct WriterPool {
    handles: Vec<JoinHandle<WriterStats>>,
}

impl WriterPool {
    /// Spawn `workers` writers consuming from `queue`.
    ///
    /// Size the pool to the store's connection budget; more writers only
    /// wait on connection checkout.
    pub fn start(
        workers: usize,
        queue: QueueReceiver,
        sink: Arc<dyn RecordSink>,
        observer: Arc<dyn IngestObserver>,
        record_length: usize,
    ) -> Result<Self> {
        let workers = workers.max(1);
        let mut handles = Vec::with_capacity(workers);

        for id in 0..workers {
            let queue = queue.clone();
            let sink = Arc::clone(&sink);
            let observer = Arc::clone(&observer);
            let handle = thread::Builder::new()
                .name(format!("writer-{id}"))
                .spawn(move || run_writer(id, &queue, sink.as_ref(), observer.as_ref(), record_length))?;
            handles.push(handle);
        }

        info!(workers, "writer pool started");
        Ok(Self { handles })
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every writer to drain the closed queue and exit.
    pub fn join(self) -> WriterStats {
        let mut total = WriterStats::default();
        for handle in self.handles {
            match handle.join() {
                Ok(stats) => total += stats,
                Err(e) => error!("writer thread panicked: {:?}", e),
            }
        }
        total
    }
}

fn run_writer(
    id: usize,
    queue: &QueueReceiver,
    sink: &dyn RecordSink,
    observer: &dyn IngestObserver,
    record_length: usize,
) -> WriterStats {
    let mut stats = WriterStats::default();

    while let Some(item) = queue.pop() {
        match persist(sink, &item, record_length) {
            Ok(latency) => {
                stats.saved += 1;
                observer.record_saved(&latency);
            }
            Err(e) => {
                stats.dropped += 1;
                warn!(writer = id, sequence = item.sequence, error = %e, "dropping record");
                observer.record_dropped(&e);
            }
        }
    }

    debug!(writer = id, saved = stats.saved, dropped = stats.dropped, "writer stopped");
    stats
}
