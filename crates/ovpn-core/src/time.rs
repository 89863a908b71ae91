//! Host-driven virtual clock.
//!
//! The engine never reads the system clock. The host updates the
//! current time before each entry point, which keeps every timer
//! deterministic and lets tests drive the session with a synthetic
//! clock.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// A point in time, in milliseconds since the epoch.
///
/// `Time::infinite()` models "never"; arithmetic saturates there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(u64);

/// A span of time in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration(u64);

const INFINITE: u64 = u64::MAX;

impl Time {
    /// The epoch itself; also the "undefined" time.
    pub const ZERO: Time = Time(0);

    pub fn from_millis(ms: u64) -> Self {
        Time(ms)
    }

    pub fn from_secs(secs: u64) -> Self {
        Time(secs.saturating_mul(1000))
    }

    /// A time infinitely far in the future.
    pub const fn infinite() -> Self {
        Time(INFINITE)
    }

    pub fn is_infinite(&self) -> bool {
        self.0 == INFINITE
    }

    /// A time is "defined" once it has moved off the epoch.
    pub fn is_defined(&self) -> bool {
        self.0 != 0 && self.0 != INFINITE
    }

    pub fn millis(&self) -> u64 {
        self.0
    }

    /// Whole seconds since the epoch, as carried in long-form packet IDs.
    pub fn seconds_since_epoch(&self) -> u32 {
        (self.0 / 1000) as u32
    }

    pub fn min(self, other: Time) -> Time {
        if other < self {
            other
        } else {
            self
        }
    }

    /// Duration until `later`, zero if `later` is in the past.
    pub fn until(&self, later: Time) -> Duration {
        if later.is_infinite() {
            Duration::infinite()
        } else {
            Duration(later.0.saturating_sub(self.0))
        }
    }
}

impl Duration {
    pub const ZERO: Duration = Duration(0);

    pub const fn from_millis(ms: u64) -> Self {
        Duration(ms)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Duration(secs * 1000)
    }

    pub const fn infinite() -> Self {
        Duration(INFINITE)
    }

    pub fn is_infinite(&self) -> bool {
        self.0 == INFINITE
    }

    /// Enabled means finite and non-zero; disabled timers never fire.
    pub fn is_enabled(&self) -> bool {
        self.0 != 0 && self.0 != INFINITE
    }

    pub fn millis(&self) -> u64 {
        self.0
    }

    pub fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    pub fn min(self, other: Duration) -> Duration {
        if other < self {
            other
        } else {
            self
        }
    }

    pub fn max(self, other: Duration) -> Duration {
        if other > self {
            other
        } else {
            self
        }
    }

    pub fn saturating_mul(self, n: u64) -> Duration {
        if self.is_infinite() {
            self
        } else {
            Duration(self.0.saturating_mul(n))
        }
    }

    /// Halve the duration, used for become-primary defaults.
    pub fn half(self) -> Duration {
        if self.is_infinite() {
            self
        } else {
            Duration(self.0 / 2)
        }
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, rhs: Duration) -> Time {
        if self.is_infinite() || rhs.is_infinite() {
            Time::infinite()
        } else {
            Time(self.0.saturating_add(rhs.0))
        }
    }
}

impl AddAssign<Duration> for Time {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub<Time> for Time {
    type Output = Duration;

    fn sub(self, rhs: Time) -> Duration {
        if self.is_infinite() {
            Duration::infinite()
        } else {
            Duration(self.0.saturating_sub(rhs.0))
        }
    }
}

impl Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        if self.is_infinite() || rhs.is_infinite() {
            Duration::infinite()
        } else {
            Duration(self.0.saturating_add(rhs.0))
        }
    }
}

impl AddAssign<Duration> for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "inf")
        } else {
            write!(f, "{}ms", self.0)
        }
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "inf")
        } else {
            write!(f, "{}ms", self.0)
        }
    }
}
