//! Outer receive loop.
//!
//! The supervisor owns the session lifecycle: compute a resume point, open a
//! SeedLink session from there, enqueue every data packet, and when the
//! session ends for any reason start over. It returns once shutdown is
//! requested, or with [`Error::QueueClosed`] once no writer is left to take
//! records.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::observer::IngestObserver;
use crate::queue::{QueueSender, ReceivedRecord};
use crate::resume::ResumeTracker;
use crate::seedlink::{SeedLink, SlinkConfig};

/// Delay before reopening a session after it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Reconnect straight away.
    Immediate,
    /// Double the delay after each session that delivered nothing, up to
    /// `max`. A session that delivered data resets it to `initial`.
    Backoff { initial: Duration, max: Duration },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Backoff {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay after `unproductive` consecutive sessions without data.
    pub fn delay(&self, unproductive: u32) -> Duration {
        match *self {
            Self::Immediate => Duration::ZERO,
            Self::Backoff { initial, max } => {
                if unproductive == 0 {
                    return Duration::ZERO;
                }
                let factor = 1u32 << (unproductive - 1).min(16);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Summary of one session.
#[derive(Debug)]
pub struct SessionOutcome {
    /// Data packets enqueued during the session.
    pub packets: u64,
    pub result: nrt_core::Result<()>,
    /// Every queue consumer is gone; no further session can make progress.
    pub queue_closed: bool,
}

/// Totals across the supervisor's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub sessions: u64,
    pub failures: u64,
    pub packets: u64,
}

/// Runs SeedLink sessions back to back until shutdown.
pub struct Supervisor {
    slink: SlinkConfig,
    resume: ResumeTracker,
    queue: QueueSender,
    observer: Arc<dyn IngestObserver>,
    policy: ReconnectPolicy,
    running: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(
        slink: SlinkConfig,
        resume: ResumeTracker,
        queue: QueueSender,
        observer: Arc<dyn IngestObserver>,
    ) -> Self {
        Self {
            slink,
            resume,
            queue,
            observer,
            policy: ReconnectPolicy::default(),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Flag that stops the loop when cleared.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request shutdown. The current session ends at its next tick.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Loop over sessions until [`stop`](Self::stop) is called.
    ///
    /// Consumes the supervisor so its queue sender is dropped on return,
    /// letting the writers drain and exit. Fails with
    /// [`Error::QueueClosed`] when the writers have all exited, since nothing
    /// received from then on could be stored.
    pub fn run(self) -> Result<SupervisorStats> {
        let mut stats = SupervisorStats::default();
        let mut unproductive = 0u32;

        info!(server = %self.slink.address(), streams = %self.slink.streams, "receive loop started");

        while self.is_running() {
            let outcome = self.run_session();
            stats.sessions += 1;
            stats.packets += outcome.packets;

            if outcome.queue_closed {
                error!(
                    sessions = stats.sessions,
                    packets = stats.packets,
                    "ingest queue closed, no writers left"
                );
                return Err(Error::QueueClosed);
            }

            if outcome.packets > 0 {
                unproductive = 0;
            } else {
                unproductive = unproductive.saturating_add(1);
            }

            match outcome.result {
                Ok(()) => {
                    info!(packets = outcome.packets, "SeedLink session ended");
                }
                Err(e) => {
                    stats.failures += 1;
                    warn!(packets = outcome.packets, error = %e, "SeedLink session failed");
                    self.observer.session_failed(&e);
                }
            }

            self.pause(self.policy.delay(unproductive));
        }

        info!(
            sessions = stats.sessions,
            failures = stats.failures,
            packets = stats.packets,
            "receive loop stopped"
        );
        Ok(stats)
    }

    /// Open one session from the current resume point and run it to the end.
    pub fn run_session(&self) -> SessionOutcome {
        let start = self.resume.resume_point();
        let config = SlinkConfig {
            start: Some(start),
            ..self.slink.clone()
        };
        info!(resume = %start, "opening SeedLink session");

        let link = SeedLink::new(config).with_shutdown(Arc::clone(&self.running));
        let mut packets = 0u64;
        let mut queue_closed = false;

        let result = link.collect_with(
            || self.observer.session_started(),
            |packet| {
                if !self.is_running() {
                    return Ok(false);
                }

                let record = ReceivedRecord {
                    sequence: packet.sequence,
                    raw: Bytes::copy_from_slice(packet.data),
                    received_at: Utc::now(),
                };
                // Blocks while the queue is full.
                if self.queue.push(record).is_err() {
                    queue_closed = true;
                    return Ok(false);
                }

                packets += 1;
                self.observer.packet_received(self.queue.len());
                Ok(true)
            },
        );

        SessionOutcome {
            packets,
            result,
            queue_closed,
        }
    }

    fn pause(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::CountingObserver;
    use crate::queue::{QueueConfig, record_queue};
    use crate::resume::{ResumeConfig, TimestampSource};
    use chrono::{DateTime, TimeZone};
    use nrt_core::{RecordBuilder, RecordStore, StreamId};
    use parking_lot::Mutex;
    use std::io::{BufRead, BufReader, Write};
    use std::net::{SocketAddr, TcpListener};
    use std::thread::JoinHandle;

    // =========================================================================
    // Reconnect policy
    // =========================================================================

    #[test]
    fn test_immediate_policy() {
        assert_eq!(ReconnectPolicy::Immediate.delay(0), Duration::ZERO);
        assert_eq!(ReconnectPolicy::Immediate.delay(10), Duration::ZERO);
    }

    #[test]
    fn test_backoff_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_millis(250));
        assert_eq!(policy.delay(2), Duration::from_millis(500));
        assert_eq!(policy.delay(3), Duration::from_secs(1));
        assert_eq!(policy.delay(20), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Server that accepts `sessions` connections in turn, records the TIME
    /// command of each, sends `packets` data packets and hangs up.
    fn serve_sessions(sessions: usize, packets: u32) -> (SocketAddr, Arc<Mutex<Vec<String>>>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let times = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&times);

        let handle = thread::spawn(move || {
            for _ in 0..sessions {
                let (stream, _) = listener.accept().unwrap();
                let mut writer = stream.try_clone().unwrap();
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 {
                        break;
                    }
                    let cmd = line.trim_end();
                    if cmd == "HELLO" {
                        writer.write_all(b"SeedLink v3.1 (mock)\r\nGNS\r\n").unwrap();
                    } else if cmd == "END" {
                        for seq in 0..packets {
                            let record = RecordBuilder::new(
                                StreamId::new("NZ", "ABAZ", "EHE", "10"),
                                Utc.with_ymd_and_hms(2016, 3, 19, 0, 0, seq).unwrap(),
                            )
                            .build()
                            .unwrap();
                            writer.write_all(format!("SL{seq:06X}").as_bytes()).unwrap();
                            writer.write_all(&record).unwrap();
                        }
                        break;
                    } else {
                        if cmd.starts_with("TIME") {
                            log.lock().push(cmd.to_string());
                        }
                        writer.write_all(b"OK\r\n").unwrap();
                    }
                }
            }
        });

        (addr, times, handle)
    }

    struct Latest(DateTime<Utc>);

    impl TimestampSource for Latest {
        fn latest_timestamp(&self) -> nrt_core::Result<Option<DateTime<Utc>>> {
            Ok(Some(self.0))
        }
    }

    fn slink(addr: SocketAddr) -> SlinkConfig {
        SlinkConfig {
            server: addr.to_string(),
            net_timeout: Duration::from_secs(5),
            keepalive: Duration::from_millis(50),
            streams: "NZ_ABAZ".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_session_enqueues_packets_from_resume_point() {
        let (addr, times, server) = serve_sessions(1, 3);
        let latest = Utc::now() - chrono::TimeDelta::minutes(1);
        let resume = ResumeTracker::new(Arc::new(Latest(latest)), ResumeConfig::default());
        let (tx, rx) = record_queue(&QueueConfig { capacity: 10 });
        let observer = Arc::new(CountingObserver::new());

        let supervisor = Supervisor::new(slink(addr), resume, tx, observer.clone());
        let outcome = supervisor.run_session();
        server.join().unwrap();

        assert_eq!(outcome.packets, 3);
        assert!(!outcome.queue_closed);
        assert!(matches!(outcome.result, Err(nrt_core::Error::SessionFailure(_))));
        assert_eq!(rx.len(), 3);
        let first = rx.pop().unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(first.raw.len(), 512);
        assert_eq!(observer.sessions_started.load(Ordering::SeqCst), 1);
        assert_eq!(observer.packets.load(Ordering::SeqCst), 3);

        let times = times.lock();
        assert_eq!(times.len(), 1);
        assert_eq!(times[0], format!("TIME {}", latest.format("%Y,%m,%d,%H,%M,%S")));
    }

    #[test]
    fn test_run_reconnects_until_stopped() {
        let (addr, _times, server) = serve_sessions(3, 2);
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        let resume = ResumeTracker::new(store, ResumeConfig::default());
        let (tx, rx) = record_queue(&QueueConfig { capacity: 100 });
        let observer = Arc::new(CountingObserver::new());

        let supervisor = Supervisor::new(slink(addr), resume, tx, observer.clone())
            .with_policy(ReconnectPolicy::Immediate);
        let running = supervisor.running_flag();
        let looper = thread::spawn(move || supervisor.run());

        // Three sessions of two packets each, then stop.
        let deadline = Instant::now() + Duration::from_secs(10);
        while rx.len() < 6 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        server.join().unwrap();
        running.store(false, Ordering::SeqCst);
        let stats = looper.join().unwrap().unwrap();

        assert_eq!(rx.len(), 6);
        assert!(stats.sessions >= 3);
        assert_eq!(stats.packets, 6);
        assert!(observer.session_failures.load(Ordering::SeqCst) >= 3);
        // Sender dropped with the supervisor: the queue drains then closes.
        for _ in 0..6 {
            assert!(rx.pop().is_some());
        }
        assert!(rx.pop().is_none());
    }

    #[test]
    fn test_run_fails_once_writers_are_gone() {
        let (addr, _times, server) = serve_sessions(1, 2);
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        let resume = ResumeTracker::new(store, ResumeConfig::default());
        let (tx, rx) = record_queue(&QueueConfig { capacity: 10 });
        drop(rx);
        let observer = Arc::new(CountingObserver::new());

        let supervisor = Supervisor::new(slink(addr), resume, tx, observer.clone())
            .with_policy(ReconnectPolicy::Immediate);
        let running = supervisor.running_flag();
        let looper = thread::spawn(move || supervisor.run());

        let deadline = Instant::now() + Duration::from_secs(10);
        while !looper.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        running.store(false, Ordering::SeqCst);

        let result = looper.join().unwrap();
        assert!(matches!(result, Err(Error::QueueClosed)));
        assert_eq!(observer.packets.load(Ordering::SeqCst), 0);
        assert_eq!(observer.session_failures.load(Ordering::SeqCst), 0);
        assert_eq!(observer.sessions_started.load(Ordering::SeqCst), 1);
        // The client hangs up early, so the server may see a broken pipe.
        let _ = server.join();
    }
}
