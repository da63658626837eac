//! Minimal SeedLink v3 client.
//!
//! One [`SeedLink::collect`] call is one session: connect, negotiate the
//! stream list, then hand every data packet to a callback until the callback
//! asks to stop or the session fails. Sessions never reconnect by themselves;
//! the caller decides when, and from which point, to open the next one.
//!
//! # Wire format
//!
//! Commands are ASCII lines terminated by `\r\n`, each answered with `OK` or
//! `ERROR`. After `END` the server streams packets made of an 8-byte header
//! (`SL` plus a six hex digit sequence number, or `SLINFO` plus two bytes)
//! followed by one fixed-length record.
//!
//! # Liveness
//!
//! After `keepalive` of inbound silence the client sends `INFO ID`, which a
//! healthy server answers with an `SLINFO` packet. If nothing at all arrives
//! for `net_timeout` the session fails as hung.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nrt_core::{Error, RECORD_LENGTH, Result};
use tracing::{debug, info};

/// Port assumed when the server address carries none.
pub const DEFAULT_PORT: u16 = 18000;

const HEADER_LEN: usize = 8;
const MIN_TICK: Duration = Duration::from_millis(10);

/// Connection settings for a SeedLink session.
#[derive(Debug, Clone)]
pub struct SlinkConfig {
    /// `host` or `host:port`.
    pub server: String,
    /// Fail the session after this long without any inbound bytes.
    pub net_timeout: Duration,
    /// Send a keepalive after this long without inbound bytes (zero disables).
    pub keepalive: Duration,
    /// Comma separated `NET_STA[:SELECTORS]` list.
    pub streams: String,
    /// Selectors applied to every station, space separated.
    pub selectors: Option<String>,
    /// Request data from this time on; `None` asks for new data only.
    pub start: Option<DateTime<Utc>>,
    /// Length of the record following each packet header.
    pub record_length: usize,
}

impl Default for SlinkConfig {
    fn default() -> Self {
        Self {
            server: format!("localhost:{DEFAULT_PORT}"),
            net_timeout: Duration::from_secs(60),
            keepalive: Duration::from_secs(1),
            streams: "*_*".to_string(),
            selectors: None,
            start: None,
            record_length: RECORD_LENGTH,
        }
    }
}

impl SlinkConfig {
    /// Address to dial, with the default port appended when missing.
    pub fn address(&self) -> String {
        if self.server.contains(':') {
            self.server.clone()
        } else {
            format!("{}:{}", self.server, DEFAULT_PORT)
        }
    }
}

/// One entry of the stream list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSelection {
    pub network: String,
    pub station: String,
    pub selectors: Vec<String>,
}

/// Parse a `NET_STA[:SEL SEL], NET_STA` stream list.
pub fn parse_streams(list: &str) -> Result<Vec<StreamSelection>> {
    let mut selections = Vec::new();

    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (station_part, selectors) = match entry.split_once(':') {
            Some((stations, sel)) => (stations, sel.split_whitespace().map(String::from).collect()),
            None => (entry, Vec::new()),
        };
        let (network, station) = station_part
            .split_once('_')
            .filter(|(n, s)| !n.is_empty() && !s.is_empty())
            .ok_or_else(|| Error::Config(format!("stream '{entry}' is not NET_STA")))?;

        selections.push(StreamSelection {
            network: network.to_string(),
            station: station.to_string(),
            selectors,
        });
    }

    if selections.is_empty() {
        return Err(Error::Config("stream list is empty".to_string()));
    }
    Ok(selections)
}

/// Connection state of a [`SeedLink`] client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Streaming,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Streaming,
            _ => Self::Disconnected,
        }
    }
}

/// A data packet handed to the collect callback.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub sequence: u32,
    pub data: &'a [u8],
}

enum PacketKind {
    Data(u32),
    Info,
}

/// SeedLink client.
pub struct SeedLink {
    config: SlinkConfig,
    state: AtomicU8,
    running: Option<Arc<AtomicBool>>,
}

impl SeedLink {
    pub fn new(config: SlinkConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(SessionState::Disconnected as u8),
            running: None,
        }
    }

    /// End the session cleanly once `running` turns false.
    pub fn with_shutdown(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = Some(running);
        self
    }

    pub fn config(&self) -> &SlinkConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn stopping(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.load(Ordering::SeqCst))
    }

    fn net_timeout(&self) -> Duration {
        self.config.net_timeout.max(MIN_TICK)
    }

    /// Run one session, calling `handler` for every data packet.
    ///
    /// The handler returns `Ok(true)` to continue, `Ok(false)` to end the
    /// session cleanly, or `Err` to abort it with that error. Any protocol,
    /// network or liveness failure ends the session with
    /// [`Error::SessionFailure`].
    pub fn collect<F>(&self, handler: F) -> Result<()>
    where
        F: FnMut(Packet<'_>) -> Result<bool>,
    {
        self.collect_with(|| {}, handler)
    }

    /// Like [`collect`](Self::collect), calling `on_streaming` once the
    /// handshake succeeded and before the first packet is read.
    pub fn collect_with<S, F>(&self, on_streaming: S, mut handler: F) -> Result<()>
    where
        S: FnOnce(),
        F: FnMut(Packet<'_>) -> Result<bool>,
    {
        self.set_state(SessionState::Connecting);
        let result = self.session(on_streaming, &mut handler);
        self.set_state(SessionState::Disconnected);
        result
    }

    fn session<S, F>(&self, on_streaming: S, handler: &mut F) -> Result<()>
    where
        S: FnOnce(),
        F: FnMut(Packet<'_>) -> Result<bool>,
    {
        let mut conn = BufReader::new(self.connect()?);
        self.handshake(&mut conn)?;
        self.set_state(SessionState::Streaming);
        on_streaming();
        self.stream_packets(&mut conn, handler)
    }

    fn connect(&self) -> Result<TcpStream> {
        let address = self.config.address();
        let timeout = self.net_timeout();
        let addrs = address
            .to_socket_addrs()
            .map_err(|e| session_failure(format!("cannot resolve {address}: {e}")))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream
                        .set_nodelay(true)
                        .and_then(|_| stream.set_read_timeout(Some(timeout)))
                        .and_then(|_| stream.set_write_timeout(Some(timeout)))
                        .map_err(io_failure("cannot configure socket"))?;
                    debug!(%addr, "connected to SeedLink server");
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(session_failure(match last_err {
            Some(e) => format!("cannot connect to {address}: {e}"),
            None => format!("no addresses for {address}"),
        }))
    }

    fn handshake(&self, conn: &mut BufReader<TcpStream>) -> Result<()> {
        send(conn, "HELLO")?;
        let software = read_line(conn)?;
        let organization = read_line(conn)?;
        info!(
            server = %self.config.address(),
            software = %software,
            organization = %organization,
            "SeedLink session opened"
        );

        let global: Vec<&str> = self
            .config
            .selectors
            .as_deref()
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default();

        for selection in parse_streams(&self.config.streams)? {
            command(
                conn,
                &format!("STATION {} {}", selection.station, selection.network),
            )?;
            for selector in global
                .iter()
                .copied()
                .chain(selection.selectors.iter().map(String::as_str))
            {
                command(conn, &format!("SELECT {selector}"))?;
            }
            match self.config.start {
                Some(start) => command(
                    conn,
                    &format!("TIME {}", start.format("%Y,%m,%d,%H,%M,%S")),
                )?,
                None => command(conn, "DATA")?,
            }
        }

        send(conn, "END")
    }

    fn stream_packets<F>(&self, conn: &mut BufReader<TcpStream>, handler: &mut F) -> Result<()>
    where
        F: FnMut(Packet<'_>) -> Result<bool>,
    {
        let net_timeout = self.net_timeout();
        let keepalive = self.config.keepalive;
        let tick = if keepalive.is_zero() {
            net_timeout
        } else {
            keepalive.min(net_timeout)
        }
        .max(MIN_TICK);
        conn.get_ref()
            .set_read_timeout(Some(tick))
            .map_err(io_failure("cannot configure socket"))?;

        let mut packet = vec![0u8; HEADER_LEN + self.config.record_length];
        let mut filled = 0;
        let mut last_rx = Instant::now();
        let mut last_keepalive = Instant::now();

        loop {
            if self.stopping() {
                debug!("shutdown requested, closing SeedLink session");
                return Ok(());
            }

            match conn.read(&mut packet[filled..]) {
                Ok(0) => return Err(session_failure("server closed the connection")),
                Ok(n) => {
                    filled += n;
                    last_rx = Instant::now();
                }
                Err(e) if is_timeout(&e) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(session_failure(format!("read failed: {e}"))),
            }

            // Fail fast on garbage instead of waiting for a full packet.
            if filled >= 2 && &packet[..2] != b"SL" {
                return Err(corrupt_header(&packet[..filled.min(HEADER_LEN)]));
            }

            if filled == packet.len() {
                filled = 0;
                match parse_header(&packet[..HEADER_LEN])? {
                    PacketKind::Info => debug!("skipping INFO packet"),
                    PacketKind::Data(sequence) => {
                        let keep_going = handler(Packet {
                            sequence,
                            data: &packet[HEADER_LEN..],
                        })?;
                        if !keep_going {
                            return Ok(());
                        }
                    }
                }
                continue;
            }

            let idle = last_rx.elapsed();
            if idle >= net_timeout {
                return Err(session_failure(format!(
                    "no data received for {:.1}s",
                    idle.as_secs_f64()
                )));
            }
            if !keepalive.is_zero() && idle >= keepalive && last_keepalive.elapsed() >= keepalive
            {
                send(conn, "INFO ID")?;
                last_keepalive = Instant::now();
            }
        }
    }
}

fn parse_header(header: &[u8]) -> Result<PacketKind> {
    if &header[..2] != b"SL" {
        return Err(corrupt_header(header));
    }
    if &header[2..6] == b"INFO" {
        return Ok(PacketKind::Info);
    }
    std::str::from_utf8(&header[2..HEADER_LEN])
        .ok()
        .filter(|digits| digits.bytes().all(|b| b.is_ascii_hexdigit()))
        .and_then(|digits| u32::from_str_radix(digits, 16).ok())
        .map(PacketKind::Data)
        .ok_or_else(|| corrupt_header(header))
}

fn send(conn: &mut BufReader<TcpStream>, cmd: &str) -> Result<()> {
    conn.get_mut()
        .write_all(format!("{cmd}\r\n").as_bytes())
        .map_err(|e| session_failure(format!("cannot send '{cmd}': {e}")))
}

fn read_line(conn: &mut BufReader<TcpStream>) -> Result<String> {
    let mut line = String::new();
    match conn.read_line(&mut line) {
        Ok(0) => Err(session_failure(
            "server closed the connection during handshake",
        )),
        Ok(_) => Ok(line.trim_end().to_string()),
        Err(e) => Err(session_failure(format!("handshake read failed: {e}"))),
    }
}

fn command(conn: &mut BufReader<TcpStream>, cmd: &str) -> Result<()> {
    send(conn, cmd)?;
    match read_line(conn)?.as_str() {
        "OK" => Ok(()),
        "ERROR" => Err(session_failure(format!("server rejected '{cmd}'"))),
        other => Err(session_failure(format!(
            "unexpected reply to '{cmd}': {other}"
        ))),
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn session_failure(msg: impl Into<String>) -> Error {
    Error::SessionFailure(msg.into())
}

fn io_failure(context: &'static str) -> impl FnOnce(io::Error) -> Error {
    move |e| session_failure(format!("{context}: {e}"))
}

fn corrupt_header(bytes: &[u8]) -> Error {
    session_failure(format!(
        "corrupt packet header {:?}",
        String::from_utf8_lossy(bytes)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use nrt_core::{RecordBuilder, StreamId};
    use parking_lot::Mutex;
    use std::net::{SocketAddr, TcpListener};
    use std::thread::{self, JoinHandle};

    // =========================================================================
    // Mock server
    // =========================================================================

    struct MockServer {
        addr: SocketAddr,
        commands: Arc<Mutex<Vec<String>>>,
        handle: JoinHandle<()>,
    }

    impl MockServer {
        /// Accept one client, answer its commands and write `packets` after
        /// `END`. Keepalives are never answered.
        fn start(packets: Vec<Vec<u8>>, close_after_packets: bool, reject: Option<&'static str>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let commands = Arc::new(Mutex::new(Vec::new()));
            let log = Arc::clone(&commands);

            let handle = thread::spawn(move || {
                let (stream, _) = listener.accept().unwrap();
                let mut writer = stream.try_clone().unwrap();
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let cmd = line.trim_end().to_string();
                    log.lock().push(cmd.clone());

                    if cmd == "HELLO" {
                        let _ = writer.write_all(b"SeedLink v3.1 (mock)\r\nGNS\r\n");
                    } else if cmd == "END" {
                        for packet in &packets {
                            let _ = writer.write_all(packet);
                        }
                        if close_after_packets {
                            break;
                        }
                    } else if cmd == "INFO ID" {
                        // Simulates a hung server.
                    } else if reject.is_some_and(|r| cmd.starts_with(r)) {
                        let _ = writer.write_all(b"ERROR\r\n");
                    } else {
                        let _ = writer.write_all(b"OK\r\n");
                    }
                }
            });

            Self {
                addr,
                commands,
                handle,
            }
        }

        fn finish(self) -> Vec<String> {
            self.handle.join().unwrap();
            let commands = self.commands.lock().clone();
            commands
        }
    }

    fn config(addr: SocketAddr) -> SlinkConfig {
        SlinkConfig {
            server: addr.to_string(),
            net_timeout: Duration::from_secs(5),
            keepalive: Duration::from_millis(50),
            streams: "NZ_ABAZ".to_string(),
            selectors: Some("??EH?".to_string()),
            start: Some(Utc.with_ymd_and_hms(2016, 3, 19, 0, 0, 0).unwrap()),
            record_length: RECORD_LENGTH,
        }
    }

    fn data_packet(sequence: u32) -> Vec<u8> {
        let record = RecordBuilder::new(
            StreamId::new("NZ", "ABAZ", "EHE", "10"),
            Utc.with_ymd_and_hms(2016, 3, 19, 0, 0, 1).unwrap(),
        )
        .sequence(sequence)
        .build()
        .unwrap();
        let mut packet = format!("SL{sequence:06X}").into_bytes();
        packet.extend_from_slice(&record);
        packet
    }

    fn info_packet() -> Vec<u8> {
        let mut packet = b"SLINFO  ".to_vec();
        packet.extend_from_slice(&[0u8; RECORD_LENGTH]);
        packet
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    #[test]
    fn test_collect_delivers_data_packets() {
        let server = MockServer::start(vec![info_packet(), data_packet(26), data_packet(27)], false, None);
        let link = SeedLink::new(config(server.addr));
        assert_eq!(link.state(), SessionState::Disconnected);

        let mut seen = Vec::new();
        let mut states = Vec::new();
        link.collect(|packet| {
            assert_eq!(packet.data.len(), RECORD_LENGTH);
            seen.push(packet.sequence);
            states.push(link.state());
            Ok(seen.len() < 2)
        })
        .unwrap();

        assert_eq!(seen, vec![26, 27]);
        assert!(states.iter().all(|s| *s == SessionState::Streaming));
        assert_eq!(link.state(), SessionState::Disconnected);

        let commands = server.finish();
        assert_eq!(
            &commands[..5],
            &[
                "HELLO",
                "STATION ABAZ NZ",
                "SELECT ??EH?",
                "TIME 2016,03,19,00,00,00",
                "END"
            ]
        );
    }

    #[test]
    fn test_no_start_requests_data_from_now() {
        let server = MockServer::start(vec![data_packet(1)], false, None);
        let mut cfg = config(server.addr);
        cfg.start = None;
        cfg.selectors = None;
        cfg.streams = "NZ_ABAZ:10EHE, NZ_WEL".to_string();

        SeedLink::new(cfg).collect(|_| Ok(false)).unwrap();

        let commands = server.finish();
        assert_eq!(
            &commands[..7],
            &[
                "HELLO",
                "STATION ABAZ NZ",
                "SELECT 10EHE",
                "DATA",
                "STATION WEL NZ",
                "DATA",
                "END"
            ]
        );
    }

    #[test]
    fn test_server_close_is_session_failure() {
        let server = MockServer::start(vec![data_packet(1)], true, None);
        let mut count = 0;
        let err = SeedLink::new(config(server.addr))
            .collect(|_| {
                count += 1;
                Ok(true)
            })
            .unwrap_err();
        assert!(matches!(err, Error::SessionFailure(ref m) if m.contains("closed")));
        assert_eq!(count, 1);
        server.finish();
    }

    #[test]
    fn test_corrupt_header_is_session_failure() {
        let mut garbage = b"XX000001".to_vec();
        garbage.extend_from_slice(&[0u8; RECORD_LENGTH]);
        let server = MockServer::start(vec![garbage], false, None);

        let err = SeedLink::new(config(server.addr))
            .collect(|_| panic!("no packet should be delivered"))
            .unwrap_err();
        assert!(matches!(err, Error::SessionFailure(ref m) if m.contains("corrupt")));
        server.finish();
    }

    #[test]
    fn test_bad_sequence_digits_are_corrupt() {
        let mut packet = b"SL00ZZ01".to_vec();
        packet.extend_from_slice(&[0u8; RECORD_LENGTH]);
        let server = MockServer::start(vec![packet], false, None);

        let err = SeedLink::new(config(server.addr))
            .collect(|_| Ok(true))
            .unwrap_err();
        assert!(matches!(err, Error::SessionFailure(ref m) if m.contains("corrupt")));
        server.finish();
    }

    #[test]
    fn test_idle_connection_times_out_after_keepalives() {
        let server = MockServer::start(Vec::new(), false, None);
        let mut cfg = config(server.addr);
        cfg.net_timeout = Duration::from_millis(300);

        let started = Instant::now();
        let err = SeedLink::new(cfg).collect(|_| Ok(true)).unwrap_err();
        assert!(matches!(err, Error::SessionFailure(ref m) if m.contains("no data")));
        assert!(started.elapsed() >= Duration::from_millis(300));

        let commands = server.finish();
        assert!(commands.iter().any(|c| c == "INFO ID"));
    }

    #[test]
    fn test_handler_error_ends_session() {
        let server = MockServer::start(vec![data_packet(1), data_packet(2)], false, None);
        let err = SeedLink::new(config(server.addr))
            .collect(|_| Err(Error::Unavailable("queue closed".into())))
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
        server.finish();
    }

    #[test]
    fn test_rejected_station_is_session_failure() {
        let server = MockServer::start(Vec::new(), false, Some("STATION"));
        let err = SeedLink::new(config(server.addr))
            .collect(|_| Ok(true))
            .unwrap_err();
        assert!(matches!(err, Error::SessionFailure(ref m) if m.contains("rejected")));
        server.finish();
    }

    #[test]
    fn test_shutdown_flag_ends_idle_session() {
        let server = MockServer::start(Vec::new(), false, None);
        let mut cfg = config(server.addr);
        cfg.net_timeout = Duration::from_secs(30);

        let running = Arc::new(AtomicBool::new(true));
        let stopper = {
            let running = Arc::clone(&running);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(150));
                running.store(false, Ordering::SeqCst);
            })
        };

        let started = Instant::now();
        SeedLink::new(cfg)
            .with_shutdown(running)
            .collect(|_| Ok(true))
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        stopper.join().unwrap();
        server.finish();
    }

    #[test]
    fn test_streaming_hook_fires_after_handshake() {
        let server = MockServer::start(Vec::new(), true, None);
        let mut started = 0;
        let err = SeedLink::new(config(server.addr))
            .collect_with(|| started += 1, |_| Ok(true))
            .unwrap_err();
        assert!(matches!(err, Error::SessionFailure(_)));
        assert_eq!(started, 1);
        server.finish();

        let server = MockServer::start(Vec::new(), false, Some("STATION"));
        let mut started = 0;
        SeedLink::new(config(server.addr))
            .collect_with(|| started += 1, |_| Ok(true))
            .unwrap_err();
        assert_eq!(started, 0);
        server.finish();
    }

    #[test]
    fn test_connection_refused() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let link = SeedLink::new(config(addr));
        let err = link.collect(|_| Ok(true)).unwrap_err();
        assert!(matches!(err, Error::SessionFailure(_)));
        assert_eq!(link.state(), SessionState::Disconnected);
    }

    // =========================================================================
    // Stream list
    // =========================================================================

    #[test]
    fn test_parse_streams() {
        let parsed = parse_streams("NZ_ABAZ:10EHE 10EHN, NZ_WEL,*_*").unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].network, "NZ");
        assert_eq!(parsed[0].station, "ABAZ");
        assert_eq!(parsed[0].selectors, vec!["10EHE", "10EHN"]);
        assert!(parsed[1].selectors.is_empty());
        assert_eq!(parsed[2].network, "*");
        assert_eq!(parsed[2].station, "*");
    }

    #[test]
    fn test_parse_streams_rejects_bad_entries() {
        assert!(matches!(parse_streams(""), Err(Error::Config(_))));
        assert!(matches!(parse_streams("ABAZ"), Err(Error::Config(_))));
        assert!(matches!(parse_streams("NZ_"), Err(Error::Config(_))));
    }

    #[test]
    fn test_address_default_port() {
        let cfg = SlinkConfig {
            server: "link.geonet.org.nz".into(),
            ..Default::default()
        };
        assert_eq!(cfg.address(), "link.geonet.org.nz:18000");
        let cfg = SlinkConfig {
            server: "127.0.0.1:18001".into(),
            ..Default::default()
        };
        assert_eq!(cfg.address(), "127.0.0.1:18001");
    }
}
