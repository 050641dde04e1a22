//! Nanosecond timestamp type used for PTS/DTS throughout the pipeline.

use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

/// Time in nanoseconds (8 bytes, Copy).
///
/// Represents time since an arbitrary epoch, usually the start of the
/// input stream. Container code converts to and from the 90 kHz MPEG
/// clock at the edges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ClockTime(u64);

/// Ticks per second of the MPEG system clock used for PTS/DTS.
pub const CLOCK_90KHZ: u64 = 90_000;

impl ClockTime {
    /// Zero time.
    pub const ZERO: Self = Self(0);

    /// Create from nanoseconds.
    #[inline]
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    /// Create from microseconds.
    #[inline]
    pub const fn from_micros(us: u64) -> Self {
        Self(us.saturating_mul(1_000))
    }

    /// Create from milliseconds.
    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms.saturating_mul(1_000_000))
    }

    /// Create from seconds.
    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Self(s.saturating_mul(1_000_000_000))
    }

    /// Create from a 90 kHz tick count.
    #[inline]
    pub const fn from_90khz(ticks: u64) -> Self {
        Self((ticks as u128 * 1_000_000_000 / CLOCK_90KHZ as u128) as u64)
    }

    /// Get as nanoseconds.
    #[inline]
    pub const fn nanos(self) -> u64 {
        self.0
    }

    /// Get as microseconds (truncated).
    #[inline]
    pub const fn micros(self) -> u64 {
        self.0 / 1_000
    }

    /// Get as milliseconds (truncated).
    #[inline]
    pub const fn millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Get as seconds (truncated).
    #[inline]
    pub const fn secs(self) -> u64 {
        self.0 / 1_000_000_000
    }

    /// Get as 90 kHz ticks (truncated).
    #[inline]
    pub const fn as_90khz(self) -> u64 {
        (self.0 as u128 * CLOCK_90KHZ as u128 / 1_000_000_000) as u64
    }

    /// Saturating addition.
    #[inline]
    pub const fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    /// Saturating subtraction.
    #[inline]
    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Add for ClockTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl Sub for ClockTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl From<Duration> for ClockTime {
    fn from(d: Duration) -> Self {
        Self(d.as_nanos().min(u64::MAX as u128) as u64)
    }
}

impl From<ClockTime> for Duration {
    fn from(t: ClockTime) -> Self {
        Duration::from_nanos(t.0)
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}s", self.secs(), self.millis() % 1_000)
    }
}
