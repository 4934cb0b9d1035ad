use super::{Instant, TimeRange};

/// Native interval of the parameter archive: 2^23 ms, about 2.33 hours.
pub const DEFAULT_BUCKET_DURATION_MS: i64 = 1 << 23;

/// Fixed-duration bucket addressing.
///
/// Bucket `k` covers `[k * duration, (k + 1) * duration)`. Every instant,
/// including pre-epoch ones, belongs to exactly one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buckets {
    duration: i64,
}

impl Buckets {
    /// Returns `None` unless `duration_ms` is positive.
    pub fn new(duration_ms: i64) -> Option<Self> {
        (duration_ms > 0).then_some(Self {
            duration: duration_ms,
        })
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn id(&self, t: Instant) -> i64 {
        t.div_euclid(self.duration)
    }

    /// Rounds down to the nearest bucket boundary. Saturates at `i64::MIN`
    /// when the boundary is not representable.
    pub fn start(&self, t: Instant) -> Instant {
        self.id(t).saturating_mul(self.duration)
    }

    /// First instant of the following bucket. Saturates at `i64::MAX` for
    /// the last representable bucket.
    pub fn end(&self, t: Instant) -> Instant {
        self.start(t).saturating_add(self.duration)
    }

    /// `n` buckets expressed in milliseconds.
    pub fn span(&self, n: i64) -> i64 {
        n.saturating_mul(self.duration)
    }

    /// Rounds an inclusive `[start, stop]` outward to whole buckets and
    /// returns it as a half-open range.
    pub fn expand(&self, start: Instant, stop: Instant) -> TimeRange {
        TimeRange::new(self.start(start), self.end(stop))
    }
}

impl Default for Buckets {
    fn default() -> Self {
        Self {
            duration: DEFAULT_BUCKET_DURATION_MS,
        }
    }
}
