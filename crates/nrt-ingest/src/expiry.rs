//! Periodic retention.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use nrt_core::RecordStore;
use tracing::{error, info, warn};

use crate::observer::IngestObserver;
use crate::Result;

/// Anything that can drop records older than a horizon.
pub trait Expire: Send + Sync {
    fn expire_older_than(&self, horizon: Duration) -> nrt_core::Result<usize>;
}

impl Expire for RecordStore {
    fn expire_older_than(&self, horizon: Duration) -> nrt_core::Result<usize> {
        RecordStore::expire_older_than(self, horizon)
    }
}

/// Configuration for the retention task.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    /// Records starting earlier than `now - retention` are deleted.
    pub retention: Duration,
    /// Time between passes.
    pub interval: Duration,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(48 * 3600),
            interval: Duration::from_secs(60),
        }
    }
}

/// Run a single retention pass.
pub fn run_once(
    store: &dyn Expire,
    retention: Duration,
    observer: &dyn IngestObserver,
) -> nrt_core::Result<usize> {
    let deleted = store.expire_older_than(retention)?;
    observer.records_expired(deleted);
    if deleted > 0 {
        info!(deleted, "expired old records");
    }
    Ok(deleted)
}

/// Background thread running retention passes every `interval`.
pub struct ExpiryTask {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ExpiryTask {
    pub fn start(
        store: Arc<dyn Expire>,
        config: ExpiryConfig,
        observer: Arc<dyn IngestObserver>,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("expiry".to_string())
            .spawn(move || {
                info!(
                    retention_secs = config.retention.as_secs(),
                    interval_secs = config.interval.as_secs(),
                    "expiry task started"
                );
                loop {
                    match stop_rx.recv_timeout(config.interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            // A failed pass is retried on the next tick.
                            if let Err(e) =
                                run_once(store.as_ref(), config.retention, observer.as_ref())
                            {
                                warn!(error = %e, "expiry pass failed");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("expiry task stopped");
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the task and wait for an in-flight pass to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("expiry thread panicked");
            }
        }
    }
}

impl Drop for ExpiryTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::CountingObserver;
    use chrono::{TimeDelta, Utc};
    use nrt_core::{Latency, NewRecord, StreamId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn save(store: &RecordStore, age: TimeDelta) {
        let start = Utc::now() - age;
        store
            .save_record(
                &StreamId::new("NZ", "ABAZ", "EHE", "10"),
                &NewRecord {
                    start,
                    end: start + TimeDelta::seconds(1),
                    raw: &[0u8; 512],
                    latency: Latency::default(),
                },
            )
            .unwrap();
    }

    struct CountingExpire(AtomicUsize);

    impl Expire for CountingExpire {
        fn expire_older_than(&self, _horizon: Duration) -> nrt_core::Result<usize> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(nrt_core::Error::Unavailable("locked".into()))
        }
    }

    #[test]
    fn test_run_once_deletes_old_records() {
        let store = RecordStore::open_in_memory().unwrap();
        save(&store, TimeDelta::hours(50));
        save(&store, TimeDelta::hours(49));
        save(&store, TimeDelta::hours(1));

        let observer = CountingObserver::new();
        let deleted = run_once(&store, ExpiryConfig::default().retention, &observer).unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(observer.expired.load(Ordering::SeqCst), 2);
        assert_eq!(store.stats().unwrap().records, 1);
    }

    #[test]
    fn test_task_keeps_running_after_failed_pass() {
        let store = Arc::new(CountingExpire(AtomicUsize::new(0)));
        let task = ExpiryTask::start(
            store.clone(),
            ExpiryConfig {
                retention: Duration::from_secs(1),
                interval: Duration::from_millis(20),
            },
            Arc::new(CountingObserver::new()),
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.0.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        task.stop();
        assert!(store.0.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_stop_is_prompt() {
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        let task = ExpiryTask::start(
            store,
            ExpiryConfig::default(),
            Arc::new(CountingObserver::new()),
        )
        .unwrap();
        let started = Instant::now();
        task.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
