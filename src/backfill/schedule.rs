use crate::config::types::ScheduleConfig;
use crate::time::{Buckets, Instant};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("schedule[{index}]: numSegments must be at least 1, got {value}")]
    NumSegments { index: usize, value: i64 },

    #[error("schedule[{index}]: startSegment must not be negative, got {value}")]
    StartSegment { index: usize, value: i64 },

    #[error("schedule[{index}]: interval must be a positive number of seconds or -1, got {value}")]
    Interval { index: usize, value: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    /// Re-run every `interval`, relative to current mission time.
    Periodic { interval: Duration },
    /// Driven by the shared bucket tick.
    Anchored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub segment_start: i64,
    pub num_segments: i64,
    pub kind: ScheduleKind,
}

impl Schedule {
    pub fn from_config(index: usize, config: &ScheduleConfig) -> Result<Self, ScheduleError> {
        if config.num_segments < 1 {
            return Err(ScheduleError::NumSegments {
                index,
                value: config.num_segments,
            });
        }
        if config.start_segment < 0 {
            return Err(ScheduleError::StartSegment {
                index,
                value: config.start_segment,
            });
        }
        let kind = match config.interval {
            None | Some(-1) => ScheduleKind::Anchored,
            Some(secs) if secs > 0 => ScheduleKind::Periodic {
                interval: Duration::from_secs(secs as u64),
            },
            Some(value) => return Err(ScheduleError::Interval { index, value }),
        };
        Ok(Self {
            segment_start: config.start_segment,
            num_segments: config.num_segments,
            kind,
        })
    }

    /// Inclusive `[start, stop]` for a periodic run at mission time `now`.
    pub fn periodic_window(&self, now: Instant, buckets: &Buckets) -> (Instant, Instant) {
        let start = now.saturating_sub(buckets.span(self.segment_start));
        (start, self.window_stop(start, buckets))
    }

    /// Inclusive `[start, stop]` for the anchored tick `run_count`, counted
    /// from the bucket `t0`.
    pub fn anchored_window(&self, t0: Instant, run_count: i64, buckets: &Buckets) -> (Instant, Instant) {
        let start = t0.saturating_add(buckets.span(run_count - self.segment_start));
        (start, self.window_stop(start, buckets))
    }

    fn window_stop(&self, start: Instant, buckets: &Buckets) -> Instant {
        start
            .saturating_add(buckets.span(self.num_segments))
            .saturating_sub(1)
    }
}

/// The configured schedules, split by kind. Immutable after construction;
/// input order is preserved within each view.
#[derive(Debug, Clone, Default)]
pub struct ScheduleTable {
    periodic: Vec<Schedule>,
    anchored: Vec<Schedule>,
}

impl ScheduleTable {
    pub fn new(configs: &[ScheduleConfig]) -> Result<Self, ScheduleError> {
        let mut table = Self::default();
        for (index, config) in configs.iter().enumerate() {
            let schedule = Schedule::from_config(index, config)?;
            match schedule.kind {
                ScheduleKind::Periodic { .. } => table.periodic.push(schedule),
                ScheduleKind::Anchored => table.anchored.push(schedule),
            }
        }
        Ok(table)
    }

    pub fn periodic(&self) -> &[Schedule] {
        &self.periodic
    }

    pub fn anchored(&self) -> &[Schedule] {
        &self.anchored
    }

    pub fn is_empty(&self) -> bool {
        self.periodic.is_empty() && self.anchored.is_empty()
    }
}
