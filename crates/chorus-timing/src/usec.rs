use std::{
    fmt,
    ops::{Add, AddAssign, Div, Sub, SubAssign},
};

pub const USEC_PER_SEC: u64 = 1_000_000;
pub const USEC_PER_MSEC: u64 = 1_000;

/// A span of time in microseconds.
///
/// All latency arithmetic in the runtime happens in this unit; the wire
/// carries it as a big-endian u64.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MicroSeconds(pub u64);

impl MicroSeconds {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn from_secs(secs: u64) -> Self {
        Self(secs * USEC_PER_SEC)
    }

    #[inline]
    pub fn from_millis(millis: u64) -> Self {
        Self(millis * USEC_PER_MSEC)
    }

    #[inline]
    pub fn as_secs(self) -> u64 {
        self.0 / USEC_PER_SEC
    }

    #[inline]
    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Add for MicroSeconds {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for MicroSeconds {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for MicroSeconds {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl SubAssign for MicroSeconds {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 = self.0.saturating_sub(rhs.0);
    }
}

impl Div<u64> for MicroSeconds {
    type Output = Self;

    fn div(self, rhs: u64) -> Self {
        Self(self.0 / rhs)
    }
}

impl From<std::time::Duration> for MicroSeconds {
    fn from(d: std::time::Duration) -> Self {
        Self(d.as_micros() as u64)
    }
}

impl From<MicroSeconds> for std::time::Duration {
    fn from(us: MicroSeconds) -> Self {
        Self::from_micros(us.0)
    }
}

impl fmt::Display for MicroSeconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}
