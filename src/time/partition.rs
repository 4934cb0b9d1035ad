//! Calendar partitioning of the archive.
//!
//! Each scheme tiles the timeline with UTC calendar periods and names every
//! period with a directory string:
//!
//! | scheme     | period      | directory  |
//! |------------|-------------|------------|
//! | `YYYY`     | year        | `2024`     |
//! | `YYYY/MM`  | month       | `2024/02`  |
//! | `YYYY/DOY` | day of year | `2024/060` |
//!
//! Storage engines use [`TimePartitioner::parse_dir`] to recover partitions
//! from directory names found on disk at startup.

use super::{Instant, TimeError, TimeRange};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Calendar decomposition of an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtcComponents {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub day_of_year: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub millisecond: u32,
}

/// Converts between instants and UTC calendar fields.
///
/// Implementations that track leap seconds can be plugged in here; the
/// partition arithmetic only relies on these two conversions.
pub trait UtcConverter: Send + Sync {
    fn to_utc(&self, t: Instant) -> Option<UtcComponents>;

    /// Midnight UTC at the start of the given day.
    fn instant_of(&self, year: i32, day_of_year: u32) -> Option<Instant>;
}

/// Unix-time calendar: every day is exactly 86 400 s, leap seconds are not
/// counted.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixUtc;

impl UtcConverter for UnixUtc {
    fn to_utc(&self, t: Instant) -> Option<UtcComponents> {
        let dt = DateTime::<Utc>::from_timestamp_millis(t)?;
        Some(UtcComponents {
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            day_of_year: dt.ordinal(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
            millisecond: dt.timestamp_subsec_millis(),
        })
    }

    fn instant_of(&self, year: i32, day_of_year: u32) -> Option<Instant> {
        let date = NaiveDate::from_yo_opt(year, day_of_year)?;
        Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PartitionSchema {
    Year,
    YearMonth,
    #[default]
    YearDayOfYear,
}

impl PartitionSchema {
    pub fn name(&self) -> &'static str {
        match self {
            PartitionSchema::Year => "YYYY",
            PartitionSchema::YearMonth => "YYYY/MM",
            PartitionSchema::YearDayOfYear => "YYYY/DOY",
        }
    }

    fn pattern(&self) -> &'static str {
        match self {
            PartitionSchema::Year => r"^(\d{4,})$",
            PartitionSchema::YearMonth => r"^(\d{4,})/(\d{2})$",
            PartitionSchema::YearDayOfYear => r"^(\d{4,})/(\d{3})$",
        }
    }
}

impl FromStr for PartitionSchema {
    type Err = TimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "YYYY" => Ok(PartitionSchema::Year),
            "YYYY/MM" => Ok(PartitionSchema::YearMonth),
            "YYYY/DOY" => Ok(PartitionSchema::YearDayOfYear),
            _ => Err(TimeError::UnknownSchema(s.to_string())),
        }
    }
}

impl fmt::Display for PartitionSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A calendar partition: `[start, end)` plus its directory name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionInfo {
    pub start: Instant,
    pub end: Instant,
    pub dir: String,
}

#[derive(Clone)]
pub struct TimePartitioner {
    schema: PartitionSchema,
    dir_pattern: Regex,
    converter: Arc<dyn UtcConverter>,
}

impl fmt::Debug for TimePartitioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimePartitioner")
            .field("schema", &self.schema)
            .finish()
    }
}

impl TimePartitioner {
    pub fn new(schema: PartitionSchema) -> Self {
        Self::with_converter(schema, Arc::new(UnixUtc))
    }

    pub fn with_converter(schema: PartitionSchema, converter: Arc<dyn UtcConverter>) -> Self {
        // The patterns are constants; a failure here is a programming error.
        let dir_pattern = Regex::new(schema.pattern()).expect("static partition pattern");
        Self {
            schema,
            dir_pattern,
            converter,
        }
    }

    /// Builds a partitioner from a scheme name such as `"YYYY/DOY"`
    /// (case-insensitive).
    pub fn from_name(name: &str) -> Result<Self, TimeError> {
        Ok(Self::new(name.parse()?))
    }

    pub fn schema(&self) -> PartitionSchema {
        self.schema
    }

    /// Returns the partition containing `t`.
    pub fn partition_info(&self, t: Instant) -> Result<PartitionInfo, TimeError> {
        let utc = self.converter.to_utc(t).ok_or(TimeError::OutOfRange(t))?;
        if utc.year < 0 {
            return Err(TimeError::OutOfRange(t));
        }
        let info = match self.schema {
            PartitionSchema::Year => self.year_partition(utc.year),
            PartitionSchema::YearMonth => self.month_partition(utc.year, utc.month),
            PartitionSchema::YearDayOfYear => self.day_partition(utc.year, utc.day_of_year),
        };
        info.ok_or(TimeError::OutOfRange(t))
    }

    /// Parses a directory name produced by [`partition_info`](Self::partition_info).
    ///
    /// Returns `None` if the name does not fit the scheme, names no calendar
    /// period (month 13, day 366 of a common year, ...) or is not in
    /// canonical form (superfluous leading zeros on the year).
    pub fn parse_dir(&self, dir: &str) -> Option<PartitionInfo> {
        let caps = self.dir_pattern.captures(dir)?;
        let year: i32 = caps.get(1)?.as_str().parse().ok()?;
        let info = match self.schema {
            PartitionSchema::Year => self.year_partition(year),
            PartitionSchema::YearMonth => {
                let month: u32 = caps.get(2)?.as_str().parse().ok()?;
                self.month_partition(year, month)
            }
            PartitionSchema::YearDayOfYear => {
                let doy: u32 = caps.get(2)?.as_str().parse().ok()?;
                self.day_partition(year, doy)
            }
        }?;
        (info.dir == dir).then_some(info)
    }

    /// Partitions overlapping `range`, in time order. Consecutive entries
    /// share their boundary.
    pub fn partitions_between(&self, range: TimeRange) -> Result<Vec<PartitionInfo>, TimeError> {
        self.partitions(range).collect()
    }

    /// Lazy form of [`partitions_between`](Self::partitions_between). Ends
    /// after the first error.
    pub fn partitions(
        &self,
        range: TimeRange,
    ) -> impl Iterator<Item = Result<PartitionInfo, TimeError>> + '_ {
        let mut next = (range.start < range.stop).then_some(range.start);
        std::iter::from_fn(move || {
            let start = next?;
            let info = self.partition_info(start);
            next = match &info {
                Ok(info) if info.end < range.stop => Some(info.end),
                _ => None,
            };
            Some(info)
        })
    }

    fn year_partition(&self, year: i32) -> Option<PartitionInfo> {
        if year < 0 {
            return None;
        }
        Some(PartitionInfo {
            start: self.converter.instant_of(year, 1)?,
            end: self.converter.instant_of(year.checked_add(1)?, 1)?,
            dir: format!("{:04}", year),
        })
    }

    fn month_partition(&self, year: i32, month: u32) -> Option<PartitionInfo> {
        if year < 0 {
            return None;
        }
        let first = NaiveDate::from_ymd_opt(year, month, 1)?;
        let next = if month == 12 {
            NaiveDate::from_ymd_opt(year.checked_add(1)?, 1, 1)?
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)?
        };
        Some(PartitionInfo {
            start: self.converter.instant_of(first.year(), first.ordinal())?,
            end: self.converter.instant_of(next.year(), next.ordinal())?,
            dir: format!("{:04}/{:02}", year, month),
        })
    }

    fn day_partition(&self, year: i32, doy: u32) -> Option<PartitionInfo> {
        if year < 0 {
            return None;
        }
        let day = NaiveDate::from_yo_opt(year, doy)?;
        let next = day.succ_opt()?;
        Some(PartitionInfo {
            start: self.converter.instant_of(year, doy)?,
            end: self.converter.instant_of(next.year(), next.ordinal())?,
            dir: format!("{:04}/{:03}", year, doy),
        })
    }
}
