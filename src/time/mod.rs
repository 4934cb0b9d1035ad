//! Time addressing for the parameter archive.
//!
//! Instants are milliseconds since 1970-01-01T00:00:00Z. Two independent
//! addressing schemes are built on top of them:
//!
//! - [`Buckets`]: fixed-duration buckets, the unit of archive consistency.
//! - [`partition::TimePartitioner`]: calendar partitions (`YYYY`, `YYYY/MM`,
//!   `YYYY/DOY`) that map an instant to a canonical directory string.

pub mod bucket;
pub mod clock;
pub mod partition;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use bucket::{Buckets, DEFAULT_BUCKET_DURATION_MS};
pub use clock::{SimulatedClock, SystemClock, TimeSource};
pub use partition::{PartitionInfo, PartitionSchema, TimePartitioner, UnixUtc, UtcComponents, UtcConverter};

/// Milliseconds since the Unix epoch.
pub type Instant = i64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("instant {0} is outside the supported calendar range")]
    OutOfRange(Instant),

    #[error("invalid time partitioning schema '{0}'. Supported schemas are: YYYY/DOY, YYYY/MM and YYYY")]
    UnknownSchema(String),

    #[error("invalid timestamp '{0}': expected RFC 3339")]
    Parse(String),
}

/// Half-open range `[start, stop)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Instant,
    pub stop: Instant,
}

impl TimeRange {
    pub fn new(start: Instant, stop: Instant) -> Self {
        Self { start, stop }
    }

    pub fn duration_ms(&self) -> i64 {
        self.stop.saturating_sub(self.start)
    }

    pub fn contains(&self, t: Instant) -> bool {
        self.start <= t && t < self.stop
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{})", format_instant(self.start), format_instant(self.stop))
    }
}

/// Formats an instant as ISO-8601 UTC with millisecond precision.
/// Instants outside chrono's range fall back to the raw millisecond count.
pub fn format_instant(t: Instant) -> String {
    match DateTime::<Utc>::from_timestamp_millis(t) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => format!("{}ms", t),
    }
}

pub fn parse_instant(s: &str) -> Result<Instant, TimeError> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
        .map_err(|_| TimeError::Parse(s.to_string()))
}

pub fn to_datetime(t: Instant) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(t)
}
