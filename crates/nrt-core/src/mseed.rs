//! Fixed-length miniSEED (SEED 2.4) record header codec.
//!
//! SeedLink delivers waveform data as fixed-length miniSEED records. Only the
//! header is interpreted here; the sample payload stays opaque and is stored
//! byte-for-byte.
//!
//! # Layout
//!
//! ```text
//! offset  size  field
//!  0       6    sequence number (ASCII digits)
//!  6       1    data quality indicator (D, R, Q or M)
//!  7       1    reserved
//!  8       5    station code (space padded)
//! 13       2    location code
//! 15       3    channel code
//! 18       2    network code
//! 20      10    start time (BTIME: year, day-of-year, h, m, s, unused, 0.0001 s)
//! 30       2    number of samples
//! 32       2    sample rate factor
//! 34       2    sample rate multiplier
//! 36       1    activity flags
//! 37       1    I/O flags
//! 38       1    data quality flags
//! 39       1    number of blockettes that follow
//! 40       4    time correction (0.0001 s)
//! 44       2    beginning of data
//! 46       2    first blockette offset
//! ```
//!
//! Blockette 1000 carries the encoding, word order and record length;
//! blockette 1001 carries a microsecond start time offset.

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Timelike, Utc};

use crate::stream::{RecordKey, StreamId};
use crate::{Error, Result};

/// Record length used by the SeedLink servers we ingest from.
pub const RECORD_LENGTH: usize = 512;

/// Size of the fixed section of the data header.
pub const FIXED_HEADER_LEN: usize = 48;

/// Activity flag bit: time correction already applied to the start time.
const TIME_CORRECTION_APPLIED: u8 = 0x02;

/// Guard against looping blockette chains.
const MAX_BLOCKETTES: usize = 32;

/// Byte order of the binary header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

/// Decoded fixed header of a miniSEED record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordHeader {
    /// Sequence number (0 when blank).
    pub sequence: u32,
    /// Data quality indicator.
    pub quality: char,
    /// Stream identity, with padding trimmed.
    pub stream: StreamId,
    /// Time of the first sample.
    pub start: DateTime<Utc>,
    pub sample_count: u16,
    /// Samples per second (0.0 when the record carries no rate).
    pub sample_rate: f64,
    /// Data encoding from blockette 1000, if present.
    pub encoding: Option<u8>,
    pub byte_order: ByteOrder,
    pub record_length: usize,
    pub data_offset: u16,
}

impl RecordHeader {
    /// Time covered by the samples: `sample_count / sample_rate`.
    ///
    /// Saturates at [`TimeDelta::MAX`] for spans no record can have; decoded
    /// headers never get there.
    pub fn duration(&self) -> TimeDelta {
        checked_duration(self.sample_count, self.sample_rate).unwrap_or(TimeDelta::MAX)
    }

    /// End of the interval covered by the record (exclusive).
    pub fn end(&self) -> DateTime<Utc> {
        self.start
            .checked_add_signed(self.duration())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Record key for this record.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.stream.clone(), self.start)
    }
}

/// Decode a record of the standard [`RECORD_LENGTH`].
pub fn decode(buf: &[u8]) -> Result<RecordHeader> {
    decode_with_length(buf, RECORD_LENGTH)
}

/// Decode a record that must be exactly `record_length` bytes long.
///
/// The input is never modified. Any structural problem yields
/// [`Error::MalformedRecord`].
pub fn decode_with_length(buf: &[u8], record_length: usize) -> Result<RecordHeader> {
    if buf.len() != record_length {
        return Err(malformed(format!(
            "expected {record_length} bytes, got {}",
            buf.len()
        )));
    }
    if buf.len() < FIXED_HEADER_LEN {
        return Err(malformed("shorter than the fixed header"));
    }

    let sequence = parse_sequence(&buf[0..6])?;

    let quality = buf[6];
    if !matches!(quality, b'D' | b'R' | b'Q' | b'M') {
        return Err(malformed(format!(
            "invalid data quality indicator 0x{quality:02x}"
        )));
    }

    let station = ascii_field(&buf[8..13], "station")?;
    let location = ascii_field(&buf[13..15], "location")?;
    let channel = ascii_field(&buf[15..18], "channel")?;
    let network = ascii_field(&buf[18..20], "network")?;
    if network.is_empty() || station.is_empty() || channel.is_empty() {
        return Err(malformed("network, station and channel must not be blank"));
    }

    let order = detect_byte_order(buf)?;

    let sample_count = read_u16(buf, 30, order);
    let rate_factor = read_u16(buf, 32, order) as i16;
    let rate_multiplier = read_u16(buf, 34, order) as i16;
    let activity_flags = buf[36];
    let time_correction = read_u32(buf, 40, order) as i32;
    let data_offset = read_u16(buf, 44, order);
    let first_blockette = read_u16(buf, 46, order);

    if sample_count > 0
        && (usize::from(data_offset) < FIXED_HEADER_LEN || usize::from(data_offset) >= buf.len())
    {
        return Err(malformed(format!("data offset {data_offset} out of range")));
    }

    let blockettes = walk_blockettes(buf, first_blockette, order)?;

    let mut start = parse_btime(buf, order)?;
    start += TimeDelta::microseconds(i64::from(blockettes.microsecond_offset));
    if activity_flags & TIME_CORRECTION_APPLIED == 0 && time_correction != 0 {
        start += TimeDelta::microseconds(i64::from(time_correction) * 100);
    }

    let rate = sample_rate(rate_factor, rate_multiplier);
    checked_duration(sample_count, rate)
        .and_then(|duration| start.checked_add_signed(duration))
        .ok_or_else(|| {
            malformed(format!(
                "{sample_count} samples at {rate} Hz span an unrepresentable interval"
            ))
        })?;

    Ok(RecordHeader {
        sequence,
        quality: char::from(quality),
        stream: StreamId::new(network, station, channel, location),
        start,
        sample_count,
        sample_rate: rate,
        encoding: blockettes.encoding,
        byte_order: order,
        record_length,
        data_offset,
    })
}

/// Nominal sample rate from the SEED factor/multiplier pair.
pub fn sample_rate(factor: i16, multiplier: i16) -> f64 {
    let f = f64::from(factor);
    let m = f64::from(multiplier);
    match (factor.signum(), multiplier.signum()) {
        (0, _) | (_, 0) => 0.0,
        (1, 1) => f * m,
        (1, -1) => -f / m,
        (-1, 1) => -m / f,
        _ => 1.0 / (f * m),
    }
}

fn checked_duration(sample_count: u16, sample_rate: f64) -> Option<TimeDelta> {
    if sample_count == 0 || sample_rate <= 0.0 || !sample_rate.is_finite() {
        return Some(TimeDelta::zero());
    }
    let micros = (f64::from(sample_count) / sample_rate * 1e6).round();
    // i64::MAX is not exact as f64; anything at or past 2^63 overflows.
    if !micros.is_finite() || micros >= i64::MAX as f64 {
        return None;
    }
    Some(TimeDelta::microseconds(micros as i64))
}

#[derive(Debug, Default)]
struct Blockettes {
    encoding: Option<u8>,
    microsecond_offset: i8,
}

fn walk_blockettes(buf: &[u8], first: u16, order: ByteOrder) -> Result<Blockettes> {
    let mut found = Blockettes::default();
    let mut offset = usize::from(first);
    let mut seen = 0;

    while offset != 0 {
        seen += 1;
        if seen > MAX_BLOCKETTES {
            return Err(malformed("too many blockettes"));
        }
        if offset < FIXED_HEADER_LEN || offset + 4 > buf.len() {
            return Err(malformed(format!("blockette offset {offset} out of range")));
        }

        let kind = read_u16(buf, offset, order);
        let next = usize::from(read_u16(buf, offset + 2, order));

        match kind {
            1000 => {
                if offset + 8 > buf.len() {
                    return Err(malformed("truncated blockette 1000"));
                }
                let exponent = buf[offset + 6];
                if exponent >= 32 || 1usize << exponent != buf.len() {
                    return Err(malformed(format!(
                        "blockette 1000 declares 2^{exponent} byte records, buffer is {}",
                        buf.len()
                    )));
                }
                found.encoding = Some(buf[offset + 4]);
            }
            1001 => {
                if offset + 8 > buf.len() {
                    return Err(malformed("truncated blockette 1001"));
                }
                found.microsecond_offset = buf[offset + 5] as i8;
            }
            _ => {}
        }

        if next != 0 && next <= offset {
            return Err(malformed("blockette chain does not advance"));
        }
        offset = next;
    }

    Ok(found)
}

fn parse_sequence(raw: &[u8]) -> Result<u32> {
    let mut value = 0u32;
    for &b in raw {
        match b {
            b'0'..=b'9' => value = value * 10 + u32::from(b - b'0'),
            b' ' | 0 => {}
            _ => return Err(malformed("sequence number is not numeric")),
        }
    }
    Ok(value)
}

fn ascii_field(raw: &[u8], name: &str) -> Result<String> {
    if !raw
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b' ' || *b == 0)
    {
        return Err(malformed(format!("{name} code contains invalid characters")));
    }
    let s: String = raw
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| char::from(*b))
        .collect();
    Ok(s.trim().to_string())
}

fn plausible_btime(year: u16, doy: u16) -> bool {
    (1900..=2100).contains(&year) && (1..=366).contains(&doy)
}

fn detect_byte_order(buf: &[u8]) -> Result<ByteOrder> {
    for order in [ByteOrder::Big, ByteOrder::Little] {
        if plausible_btime(read_u16(buf, 20, order), read_u16(buf, 22, order)) {
            return Ok(order);
        }
    }
    Err(malformed("start time year/day-of-year implausible in either byte order"))
}

fn parse_btime(buf: &[u8], order: ByteOrder) -> Result<DateTime<Utc>> {
    let year = read_u16(buf, 20, order);
    let doy = read_u16(buf, 22, order);
    let (hour, minute, second) = (buf[24], buf[25], buf[26]);
    let fract = read_u16(buf, 28, order);

    if hour > 23 || minute > 59 || second > 60 || fract > 9999 {
        return Err(malformed(format!(
            "invalid start time {hour:02}:{minute:02}:{second:02}.{fract:04}"
        )));
    }

    let midnight = NaiveDate::from_yo_opt(i32::from(year), u32::from(doy))
        .and_then(|d| d.and_hms_opt(u32::from(hour), u32::from(minute), 0))
        .ok_or_else(|| malformed(format!("invalid start date {year}-{doy:03}")))?;

    // Leap seconds (second == 60) roll into the next minute.
    let start = midnight.and_utc()
        + TimeDelta::seconds(i64::from(second))
        + TimeDelta::microseconds(i64::from(fract) * 100);
    Ok(start)
}

fn read_u16(buf: &[u8], at: usize, order: ByteOrder) -> u16 {
    let bytes = [buf[at], buf[at + 1]];
    match order {
        ByteOrder::Big => u16::from_be_bytes(bytes),
        ByteOrder::Little => u16::from_le_bytes(bytes),
    }
}

fn read_u32(buf: &[u8], at: usize, order: ByteOrder) -> u32 {
    let bytes = [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]];
    match order {
        ByteOrder::Big => u32::from_be_bytes(bytes),
        ByteOrder::Little => u32::from_le_bytes(bytes),
    }
}

fn write_u16(buf: &mut [u8], at: usize, value: u16, order: ByteOrder) {
    let bytes = match order {
        ByteOrder::Big => value.to_be_bytes(),
        ByteOrder::Little => value.to_le_bytes(),
    };
    buf[at..at + 2].copy_from_slice(&bytes);
}

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedRecord(msg.into())
}

// =============================================================================
// Encoding
// =============================================================================

/// Builds valid fixed-length miniSEED records.
///
/// Records carry blockette 1000 and 1001 at offsets 48 and 56, and the payload
/// starts at offset 64. Used by the file loader tests and by tooling that
/// needs synthetic records.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    stream: StreamId,
    start: DateTime<Utc>,
    sequence: u32,
    quality: u8,
    rate_factor: i16,
    rate_multiplier: i16,
    sample_count: u16,
    encoding: u8,
    byte_order: ByteOrder,
    record_length: usize,
    payload: Vec<u8>,
}

/// Offset of the first data byte in built records.
const BUILT_DATA_OFFSET: usize = 64;

impl RecordBuilder {
    pub fn new(stream: StreamId, start: DateTime<Utc>) -> Self {
        Self {
            stream,
            start,
            sequence: 1,
            quality: b'D',
            rate_factor: 100,
            rate_multiplier: 1,
            sample_count: 0,
            encoding: 11, // Steim-2
            byte_order: ByteOrder::Big,
            record_length: RECORD_LENGTH,
            payload: Vec::new(),
        }
    }

    pub fn sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    /// Set the SEED sample rate factor and multiplier.
    pub fn sample_rate(mut self, factor: i16, multiplier: i16) -> Self {
        self.rate_factor = factor;
        self.rate_multiplier = multiplier;
        self
    }

    pub fn sample_count(mut self, count: u16) -> Self {
        self.sample_count = count;
        self
    }

    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    pub fn record_length(mut self, length: usize) -> Self {
        self.record_length = length;
        self
    }

    /// Opaque encoded sample data placed after the blockettes.
    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        if !self.record_length.is_power_of_two() || self.record_length < 128 {
            return Err(malformed(format!(
                "record length {} is not a power of two >= 128",
                self.record_length
            )));
        }
        if self.payload.len() > self.record_length - BUILT_DATA_OFFSET {
            return Err(malformed(format!(
                "payload of {} bytes does not fit a {} byte record",
                self.payload.len(),
                self.record_length
            )));
        }
        if self.sequence > 999_999 {
            return Err(malformed("sequence number exceeds six digits"));
        }
        let year = self.start.year();
        if !(1900..=2100).contains(&year) {
            return Err(malformed(format!("year {year} out of range")));
        }

        let order = self.byte_order;
        let mut buf = vec![0u8; self.record_length];

        buf[0..6].copy_from_slice(format!("{:06}", self.sequence).as_bytes());
        buf[6] = self.quality;
        buf[7] = b' ';
        put_field(&mut buf[8..13], &self.stream.station, "station")?;
        put_field(&mut buf[13..15], &self.stream.location, "location")?;
        put_field(&mut buf[15..18], &self.stream.channel, "channel")?;
        put_field(&mut buf[18..20], &self.stream.network, "network")?;

        let micros = (self.start.nanosecond() / 1_000).min(999_999);
        write_u16(&mut buf, 20, year as u16, order);
        write_u16(&mut buf, 22, self.start.ordinal() as u16, order);
        buf[24] = self.start.hour() as u8;
        buf[25] = self.start.minute() as u8;
        buf[26] = self.start.second() as u8;
        buf[27] = 0;
        write_u16(&mut buf, 28, (micros / 100) as u16, order);

        write_u16(&mut buf, 30, self.sample_count, order);
        write_u16(&mut buf, 32, self.rate_factor as u16, order);
        write_u16(&mut buf, 34, self.rate_multiplier as u16, order);
        buf[36] = 0;
        buf[37] = 0;
        buf[38] = 0;
        buf[39] = 2;
        buf[40..44].fill(0);
        write_u16(&mut buf, 44, BUILT_DATA_OFFSET as u16, order);
        write_u16(&mut buf, 46, 48, order);

        // Blockette 1000: encoding, word order, record length exponent.
        write_u16(&mut buf, 48, 1000, order);
        write_u16(&mut buf, 50, 56, order);
        buf[52] = self.encoding;
        buf[53] = u8::from(order == ByteOrder::Big);
        buf[54] = self.record_length.trailing_zeros() as u8;
        buf[55] = 0;

        // Blockette 1001: timing quality, microsecond offset, frame count.
        write_u16(&mut buf, 56, 1001, order);
        write_u16(&mut buf, 58, 0, order);
        buf[60] = 100;
        buf[61] = (micros % 100) as u8;
        buf[62] = 0;
        buf[63] = 0;

        buf[BUILT_DATA_OFFSET..BUILT_DATA_OFFSET + self.payload.len()]
            .copy_from_slice(&self.payload);

        Ok(buf)
    }
}

fn put_field(dest: &mut [u8], value: &str, name: &str) -> Result<()> {
    if value.len() > dest.len() || !value.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(malformed(format!(
            "{name} code '{value}' must be at most {} alphanumeric characters",
            dest.len()
        )));
    }
    dest.fill(b' ');
    dest[..value.len()].copy_from_slice(value.as_bytes());
    Ok(())
}
