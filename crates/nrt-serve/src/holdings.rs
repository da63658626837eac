//! Holdings search: which record keys exist for a stream selection and window.
//!
//! Pure query translation. Field patterns are compiled once, the overlap
//! computation is delegated to the store's time index, and the resulting
//! keys come back in start-time order. Nothing here is cached; only the
//! per-key payload fetch that usually follows goes through the record cache.

use chrono::{DateTime, Utc};
use nrt_core::{FieldMatch, RecordKey, RecordStore, Result, StreamId, StreamPattern, TimeWindow};

/// Anything that can answer an overlap query over stored records.
pub trait HoldingsIndex: Send + Sync {
    fn search_holdings(&self, pattern: &StreamPattern, window: &TimeWindow)
    -> Result<Vec<RecordKey>>;
}

impl HoldingsIndex for RecordStore {
    fn search_holdings(
        &self,
        pattern: &StreamPattern,
        window: &TimeWindow,
    ) -> Result<Vec<RecordKey>> {
        RecordStore::search_holdings(self, pattern, window)
    }
}

/// How the field strings of a [`DataSearch`] are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatternSyntax {
    /// Regular expressions such as `^NZ$`.
    #[default]
    Regex,
    /// FDSN wildcards (`*`, `?`, `--` for an empty location).
    Glob,
    /// Literal codes.
    Exact,
}

/// A holdings query as received from a caller.
#[derive(Debug, Clone)]
pub struct DataSearch {
    pub network: String,
    pub station: String,
    pub channel: String,
    pub location: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DataSearch {
    /// Search one stream exactly over `[start, end]`.
    pub fn for_stream(stream: &StreamId, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            network: stream.network.clone(),
            station: stream.station.clone(),
            channel: stream.channel.clone(),
            location: stream.location.clone(),
            start,
            end,
        }
    }

    /// Compile the field patterns and validate the window.
    pub fn compile(&self, syntax: PatternSyntax) -> Result<(StreamPattern, TimeWindow)> {
        let field = |value: &str| match syntax {
            PatternSyntax::Regex => FieldMatch::regex(value),
            PatternSyntax::Glob => FieldMatch::glob(value),
            PatternSyntax::Exact => Ok(FieldMatch::exact(value)),
        };

        let pattern = StreamPattern {
            network: field(&self.network)?,
            station: field(&self.station)?,
            channel: field(&self.channel)?,
            location: field(&self.location)?,
        };
        let window = TimeWindow::new(self.start, self.end)?;
        Ok((pattern, window))
    }
}

/// Keys of every record matching `search`, ordered by start time.
pub fn holdings_search(
    index: &dyn HoldingsIndex,
    search: &DataSearch,
    syntax: PatternSyntax,
) -> Result<Vec<RecordKey>> {
    let (pattern, window) = search.compile(syntax)?;
    index.search_holdings(&pattern, &window)
}
