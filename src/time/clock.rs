//! Mission time sources.
//!
//! Mission time may differ from the wall clock, so the engine never calls
//! `Utc::now()` directly; it asks a [`TimeSource`].

use super::Instant;
use chrono::Utc;

pub trait TimeSource: Send + Sync {
    fn now(&self) -> Instant;
}

/// Mission time equals the host's wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> Instant {
        Utc::now().timestamp_millis()
    }
}

/// Mission time that starts at a fixed origin and advances with the Tokio
/// clock.
///
/// Under `tokio::time::pause()` the clock only moves when the runtime
/// auto-advances or when `tokio::time::advance` is called, which makes
/// timer-driven behaviour reproducible.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    origin: Instant,
    started: tokio::time::Instant,
}

impl SimulatedClock {
    pub fn new(origin: Instant) -> Self {
        Self {
            origin,
            started: tokio::time::Instant::now(),
        }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }
}

impl TimeSource for SimulatedClock {
    fn now(&self) -> Instant {
        let elapsed = self.started.elapsed().as_millis();
        self.origin
            .saturating_add(i64::try_from(elapsed).unwrap_or(i64::MAX))
    }
}
