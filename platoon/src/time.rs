//! Millisecond time types.
//!
//! The engine never reads a wall clock on its own. Every handler receives
//! `now` explicitly, which keeps simulation runs reproducible.

use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Point in protocol time, in milliseconds since an arbitrary epoch.
///
/// Carried on the wire in every envelope, so heartbeat freshness is judged
/// against the sender's stamp rather than the receiver's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1000))
    }

    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Saturating addition of a duration.
    #[inline]
    pub const fn saturating_add(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.0))
    }

    /// Time elapsed since `earlier`, zero if `earlier` lies in the future.
    #[inline]
    pub const fn saturating_sub(self, earlier: Timestamp) -> Duration {
        Duration(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}s", self.0 / 1000, self.0 % 1000)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn add(self, rhs: Duration) -> Timestamp {
        self.saturating_add(rhs)
    }
}

impl AddAssign<Duration> for Timestamp {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        *self = self.saturating_add(rhs);
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Timestamp) -> Duration {
        self.saturating_sub(rhs)
    }
}

/// Span of protocol time in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Duration(u64);

impl Duration {
    pub const ZERO: Duration = Duration(0);

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Duration(ms)
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Duration(secs.saturating_mul(1000))
    }

    #[inline]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Integer fraction of this duration (`self / divisor`), zero for a zero divisor.
    #[inline]
    pub const fn fraction(self, divisor: u64) -> Self {
        match self.0.checked_div(divisor) {
            Some(ms) => Duration(ms),
            None => Duration(0),
        }
    }
}

impl Add for Duration {
    type Output = Duration;

    #[inline]
    fn add(self, rhs: Duration) -> Duration {
        Duration(self.0.saturating_add(rhs.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_arithmetic_saturates() {
        let t = Timestamp::from_secs(10);
        assert_eq!((t + Duration::from_millis(250)).as_millis(), 10_250);
        assert_eq!(Timestamp::MAX + Duration::from_secs(1), Timestamp::MAX);

        // Elapsed time never goes negative, even for stamps from the future
        let later = Timestamp::from_secs(12);
        assert_eq!(t - later, Duration::ZERO);
        assert_eq!(later - t, Duration::from_secs(2));
    }

    #[test]
    fn test_duration_fraction() {
        let interval = Duration::from_secs(1);
        assert_eq!(interval.fraction(4), Duration::from_millis(250));
        assert_eq!(interval.fraction(0), Duration::ZERO);
        assert!(Duration::ZERO.is_zero());
    }

    #[test]
    fn test_timestamp_display() {
        assert_eq!(Timestamp::from_millis(2_005).to_string(), "2.005s");
        assert_eq!(Timestamp::ZERO.to_string(), "0.000s");
    }
}
