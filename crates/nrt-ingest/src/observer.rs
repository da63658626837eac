//! Pipeline event hooks.
//!
//! Every pipeline component reports through an [`IngestObserver`] rather than
//! touching the metrics registry directly. Production wires in
//! [`MetricsObserver`]; tests inject [`CountingObserver`] and assert on it.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use metrics::{counter, gauge, histogram};
use nrt_core::Latency;
use nrt_core::metrics::{
    LATENCY_PERSISTENCE, LATENCY_TRANSMISSION, PACKETS_RECEIVED, QUEUE_DEPTH, RECORDS_DROPPED,
    RECORDS_EXPIRED, RECORDS_SAVED, SESSION_FAILURES, SESSIONS_STARTED,
};

use crate::error::RecordError;

/// Receives pipeline events. All hooks default to no-ops.
pub trait IngestObserver: Send + Sync {
    /// A SeedLink session completed its handshake.
    fn session_started(&self) {}

    /// A SeedLink session ended with an error.
    fn session_failed(&self, _err: &nrt_core::Error) {}

    /// A data packet was enqueued; `queue_depth` is the depth after the push.
    fn packet_received(&self, _queue_depth: usize) {}

    /// A writer persisted a record.
    fn record_saved(&self, _latency: &Latency) {}

    /// A writer dropped a record.
    fn record_dropped(&self, _err: &RecordError) {}

    /// A retention pass deleted `count` records.
    fn records_expired(&self, _count: usize) {}
}

/// Forwards pipeline events to the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl IngestObserver for MetricsObserver {
    fn session_started(&self) {
        counter!(SESSIONS_STARTED).increment(1);
    }

    fn session_failed(&self, _err: &nrt_core::Error) {
        counter!(SESSION_FAILURES).increment(1);
    }

    fn packet_received(&self, queue_depth: usize) {
        counter!(PACKETS_RECEIVED).increment(1);
        gauge!(QUEUE_DEPTH).set(queue_depth as f64);
    }

    fn record_saved(&self, latency: &Latency) {
        counter!(RECORDS_SAVED).increment(1);
        histogram!(LATENCY_TRANSMISSION).record(latency.transmission);
        histogram!(LATENCY_PERSISTENCE).record(latency.persistence);
    }

    fn record_dropped(&self, err: &RecordError) {
        counter!(RECORDS_DROPPED, "reason" => err.reason()).increment(1);
    }

    fn records_expired(&self, count: usize) {
        counter!(RECORDS_EXPIRED).increment(count as u64);
    }
}

/// Counts pipeline events in memory.
#[derive(Debug, Default)]
pub struct CountingObserver {
    pub sessions_started: AtomicU64,
    pub session_failures: AtomicU64,
    pub packets: AtomicU64,
    pub saved: AtomicU64,
    pub dropped_malformed: AtomicU64,
    pub dropped_store: AtomicU64,
    pub expired: AtomicU64,
    pub max_queue_depth: AtomicUsize,
}

impl CountingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> u64 {
        self.saved.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped_malformed.load(Ordering::SeqCst) + self.dropped_store.load(Ordering::SeqCst)
    }
}

impl IngestObserver for CountingObserver {
    fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::SeqCst);
    }

    fn session_failed(&self, _err: &nrt_core::Error) {
        self.session_failures.fetch_add(1, Ordering::SeqCst);
    }

    fn packet_received(&self, queue_depth: usize) {
        self.packets.fetch_add(1, Ordering::SeqCst);
        self.max_queue_depth.fetch_max(queue_depth, Ordering::SeqCst);
    }

    fn record_saved(&self, _latency: &Latency) {
        self.saved.fetch_add(1, Ordering::SeqCst);
    }

    fn record_dropped(&self, err: &RecordError) {
        match err {
            RecordError::Decode(_) => self.dropped_malformed.fetch_add(1, Ordering::SeqCst),
            RecordError::Store { .. } => self.dropped_store.fetch_add(1, Ordering::SeqCst),
        };
    }

    fn records_expired(&self, count: usize) {
        self.expired.fetch_add(count as u64, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    #[test]
    fn test_counting_observer() {
        let observer = CountingObserver::new();
        observer.packet_received(3);
        observer.packet_received(1);
        observer.record_saved(&Latency::default());
        observer.record_dropped(&RecordError::Decode(nrt_core::Error::MalformedRecord(
            "x".into(),
        )));
        observer.record_dropped(&RecordError::Store {
            key: "k".into(),
            source: nrt_core::Error::Unavailable("down".into()),
        });
        observer.records_expired(7);

        assert_eq!(observer.packets.load(Ordering::SeqCst), 2);
        assert_eq!(observer.max_queue_depth.load(Ordering::SeqCst), 3);
        assert_eq!(observer.saved(), 1);
        assert_eq!(observer.dropped(), 2);
        assert_eq!(observer.expired.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_metrics_observer_records_drop_reason() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            let observer = MetricsObserver;
            observer.record_dropped(&RecordError::Decode(nrt_core::Error::MalformedRecord(
                "x".into(),
            )));
            observer.record_saved(&Latency {
                transmission: 1.5,
                persistence: 2.0,
            });
        });
        let rendered = handle.render();
        assert!(rendered.contains(RECORDS_DROPPED));
        assert!(rendered.contains("reason=\"malformed\""));
        assert!(rendered.contains(RECORDS_SAVED));
    }
}
