use std::time::Duration;
use tokio::time::Instant;

/// Monotonic point in time taken from the runtime clock.
///
/// Backed by the monotonic OS clock, so wall-clock adjustments never move it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Instant);

impl Timestamp {
    /// Elapsed time from `earlier` to `self`, saturating at zero.
    #[inline]
    pub fn duration_since(self, earlier: Timestamp) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }

    pub fn as_instant(self) -> Instant {
        self.0
    }
}

impl From<Instant> for Timestamp {
    fn from(instant: Instant) -> Self {
        Self(instant)
    }
}

/// Timestamp source used for every timing breakpoint.
///
/// A read is a single monotonic clock query with no allocation or locking, which
/// keeps instrumentation overhead in the tens of nanoseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrecisionTimer;

impl PrecisionTimer {
    #[inline]
    pub fn now() -> Timestamp {
        Timestamp(Instant::now())
    }

    /// Elapsed time between `a` and `b`. Only defined for `b >= a`.
    #[inline]
    pub fn delta(a: Timestamp, b: Timestamp) -> Duration {
        debug_assert!(b >= a, "delta called with b earlier than a");
        b.duration_since(a)
    }

    #[inline]
    pub fn elapsed(since: Timestamp) -> Duration {
        Self::delta(since, Self::now())
    }
}
