//! Where to restart the upstream stream after a (re)connect.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use nrt_core::RecordStore;
use tracing::{debug, warn};

/// Anything that knows the newest stored record start time.
pub trait TimestampSource: Send + Sync {
    /// Latest record start time across all streams, `None` when empty.
    fn latest_timestamp(&self) -> nrt_core::Result<Option<DateTime<Utc>>>;
}

impl TimestampSource for RecordStore {
    fn latest_timestamp(&self) -> nrt_core::Result<Option<DateTime<Utc>>> {
        RecordStore::latest_timestamp(self)
    }
}

/// Configuration for [`ResumeTracker`].
#[derive(Debug, Clone)]
pub struct ResumeConfig {
    /// Never request data older than this before now.
    pub max_lookback: Duration,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            max_lookback: Duration::from_secs(10 * 60),
        }
    }
}

/// Computes the resume point for each new session.
pub struct ResumeTracker {
    source: Arc<dyn TimestampSource>,
    max_lookback: TimeDelta,
}

impl ResumeTracker {
    pub fn new(source: Arc<dyn TimestampSource>, config: ResumeConfig) -> Self {
        Self {
            source,
            max_lookback: TimeDelta::from_std(config.max_lookback).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Resume point relative to the current time.
    pub fn resume_point(&self) -> DateTime<Utc> {
        self.resume_point_at(Utc::now())
    }

    /// Resume point relative to `now`.
    ///
    /// The latest stored timestamp, clamped to `now - max_lookback` when the
    /// store is empty, unreachable, or further behind than that. A latest
    /// timestamp ahead of `now` is used as is.
    pub fn resume_point_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let floor = now
            .checked_sub_signed(self.max_lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        match self.source.latest_timestamp() {
            Ok(Some(latest)) if latest >= floor => latest,
            Ok(Some(latest)) => {
                debug!(
                    latest = %latest,
                    resume = %floor,
                    "latest record is outside the lookback window, clamping"
                );
                floor
            }
            Ok(None) => floor,
            Err(e) => {
                warn!(
                    error = %e,
                    resume = %floor,
                    "failed to read latest timestamp, resuming from lookback window"
                );
                floor
            }
        }
    }
}
