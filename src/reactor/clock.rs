//! Time sources for the reactor.
//!
//! The reactor asks its clock for the current [`Time`] when ordering
//! deferred callbacks. [`WallClock`] is the production source;
//! [`VirtualClock`] only advances when told to, so timeout and throttle
//! behavior can be tested deterministically without sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A monotonic instant in nanoseconds since the clock's epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    /// The zero instant.
    pub const ZERO: Self = Self(0);

    /// Creates a time from nanoseconds since the epoch.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a time from milliseconds since the epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Returns the nanoseconds since the epoch.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Advances the instant by a duration, saturating on overflow.
    #[must_use]
    pub fn saturating_add(self, delta: Duration) -> Self {
        let nanos = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(nanos))
    }

    /// Returns the duration from `earlier` to `self`, or zero when `self`
    /// is not later.
    #[must_use]
    pub fn saturating_since(self, earlier: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

/// Source of the current time.
pub trait TimeSource: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// Wall-clock time source backed by `std::time::Instant`.
///
/// The epoch is the moment this source was created.
#[derive(Debug)]
pub struct WallClock {
    epoch: std::time::Instant,
}

impl WallClock {
    /// Creates a new wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for WallClock {
    fn now(&self) -> Time {
        let elapsed = self.epoch.elapsed();
        Time::from_nanos(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
    }
}

/// Virtual time source that advances only on request.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use stepflow::reactor::{Time, TimeSource, VirtualClock};
///
/// let clock = VirtualClock::new();
/// assert_eq!(clock.now(), Time::ZERO);
/// clock.advance(Duration::from_secs(1));
/// assert_eq!(clock.now(), Time::from_millis(1000));
/// ```
#[derive(Debug, Default)]
pub struct VirtualClock {
    now: AtomicU64,
}

impl VirtualClock {
    /// Creates a virtual clock starting at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        let nanos = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> Time {
        Time::from_nanos(self.now.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_arithmetic() {
        let t = Time::from_millis(5);
        let later = t.saturating_add(Duration::from_millis(10));
        assert_eq!(later, Time::from_millis(15));
        assert_eq!(later.saturating_since(t), Duration::from_millis(10));
        assert_eq!(t.saturating_since(later), Duration::ZERO);
    }

    #[test]
    fn wall_clock_is_monotonic() {
        let clock = WallClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn virtual_clock_advances_on_request_only() {
        let clock = VirtualClock::new();
        assert_eq!(clock.now(), Time::ZERO);
        assert_eq!(clock.now(), Time::ZERO);

        clock.advance(Duration::from_millis(50));
        assert_eq!(clock.now(), Time::from_millis(50));
    }
}
