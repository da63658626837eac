//! Stream identity, record keys and stream selection patterns.
//!
//! A stream is identified by its `(network, station, channel, location)` codes.
//! A record within a stream is identified by its start time, and the pair is
//! rendered as a single [`RecordKey`] string:
//!
//! ```text
//! NZ_ABAZ_EHE_10_2016-03-19T00:00:01.968393Z
//! ```
//!
//! The time part always carries six fractional digits, so keys of one stream
//! sort lexically in time order. The location code may be empty, which yields
//! two adjacent underscores (`NZ_WEL_HHZ__2016-...`).

use std::fmt;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use regex::Regex;

use crate::{Error, Result};

/// Identity of a waveform stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId {
    pub network: String,
    pub station: String,
    pub channel: String,
    pub location: String,
}

impl StreamId {
    /// Build a stream identity from its four codes.
    pub fn new(
        network: impl Into<String>,
        station: impl Into<String>,
        channel: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            station: station.into(),
            channel: channel.into(),
            location: location.into(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.network, self.station, self.channel, self.location
        )
    }
}

/// Cache and lookup key for one record: stream identity plus start time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    stream: StreamId,
    start: DateTime<Utc>,
}

impl RecordKey {
    /// Create a key. The start time is truncated to microseconds, the
    /// precision carried by the key string and by the store.
    pub fn new(stream: StreamId, start: DateTime<Utc>) -> Self {
        Self {
            stream,
            start: start.trunc_subsecs(6),
        }
    }

    /// Parse a key string produced by [`RecordKey`]'s `Display` impl.
    pub fn parse(key: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = key.splitn(5, '_');
        let (Some(network), Some(station), Some(channel), Some(location), Some(time)) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(invalid("expected NET_STA_CHA_LOC_TIME"));
        };

        if network.is_empty() || station.is_empty() || channel.is_empty() {
            return Err(invalid("network, station and channel must not be empty"));
        }

        let start = DateTime::parse_from_rfc3339(time)
            .map_err(|e| invalid(&format!("bad start time: {e}")))?
            .with_timezone(&Utc);

        Ok(Self::new(
            StreamId::new(network, station, channel, location),
            start,
        ))
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}",
            self.stream,
            self.start.to_rfc3339_opts(SecondsFormat::Micros, true)
        )
    }
}

/// Matcher for a single identity field.
#[derive(Debug, Clone)]
pub enum FieldMatch {
    /// Matches every value.
    Any,
    /// Matches one exact code.
    Exact(String),
    /// Matches values accepted by a regular expression.
    Regex(Regex),
}

impl FieldMatch {
    pub fn exact(code: impl Into<String>) -> Self {
        Self::Exact(code.into())
    }

    /// Compile a regular expression matcher (e.g. `^NZ$`).
    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Self::Regex)
            .map_err(|e| Error::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    /// Compile an FDSN-style wildcard pattern.
    ///
    /// `*` matches any run of characters and `?` a single character. A bare
    /// `*` matches everything and `--` selects the empty location code.
    pub fn glob(pattern: &str) -> Result<Self> {
        match pattern {
            "*" => return Ok(Self::Any),
            "--" => return Ok(Self::Exact(String::new())),
            _ => {}
        }

        if !pattern.contains(['*', '?']) {
            return Ok(Self::exact(pattern));
        }

        let mut re = String::with_capacity(pattern.len() + 8);
        re.push('^');
        for c in pattern.chars() {
            match c {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                other => re.push_str(&regex::escape(&other.to_string())),
            }
        }
        re.push('$');

        Self::regex(&re)
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(code) => code == value,
            Self::Regex(re) => re.is_match(value),
        }
    }
}

/// Selection of streams by independently matching each identity field.
#[derive(Debug, Clone)]
pub struct StreamPattern {
    pub network: FieldMatch,
    pub station: FieldMatch,
    pub channel: FieldMatch,
    pub location: FieldMatch,
}

impl StreamPattern {
    /// A pattern that selects every stream.
    pub fn any() -> Self {
        Self {
            network: FieldMatch::Any,
            station: FieldMatch::Any,
            channel: FieldMatch::Any,
            location: FieldMatch::Any,
        }
    }

    /// A pattern that selects exactly one stream.
    pub fn exact(stream: &StreamId) -> Self {
        Self {
            network: FieldMatch::exact(&stream.network),
            station: FieldMatch::exact(&stream.station),
            channel: FieldMatch::exact(&stream.channel),
            location: FieldMatch::exact(&stream.location),
        }
    }

    pub fn matches(&self, stream: &StreamId) -> bool {
        self.network.matches(&stream.network)
            && self.station.matches(&stream.station)
            && self.channel.matches(&stream.channel)
            && self.location.matches(&stream.location)
    }
}

impl Default for StreamPattern {
    fn default() -> Self {
        Self::any()
    }
}

/// Closed query window `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Whether the half-open record interval `[start, end)` intersects the
    /// window. Intervals that only touch a window edge do not.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        start < self.end && end > self.start
    }
}
