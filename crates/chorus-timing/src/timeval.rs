use std::time::{SystemTime, UNIX_EPOCH};

use crate::usec::{MicroSeconds, USEC_PER_SEC};

/// A wall-clock timestamp with microsecond resolution.
///
/// Timer deadlines and the latency handshake both use wall time so that the
/// two peers of a connection can compare their clocks. The wire encodes a
/// timestamp as two big-endian u32s (seconds, microseconds).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timeval {
    pub sec: u32,
    pub usec: u32,
}

impl Timeval {
    pub const ZERO: Self = Self { sec: 0, usec: 0 };

    pub fn new(sec: u32, usec: u32) -> Self {
        Self { sec: sec + usec / USEC_PER_SEC as u32, usec: usec % USEC_PER_SEC as u32 }
    }

    pub fn now() -> Self {
        // Pre-epoch clocks collapse to zero; the runtime only ever compares
        // and subtracts these, so that degrades gracefully.
        let d = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self { sec: d.as_secs() as u32, usec: d.subsec_micros() }
    }

    #[inline]
    fn as_usec(self) -> u64 {
        u64::from(self.sec) * USEC_PER_SEC + u64::from(self.usec)
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn since(self, earlier: Self) -> MicroSeconds {
        MicroSeconds(self.as_usec().saturating_sub(earlier.as_usec()))
    }

    /// Time elapsed between this timestamp and the current wall clock.
    pub fn age(self) -> MicroSeconds {
        Self::now().since(self)
    }

    pub fn add_usec(self, delta: MicroSeconds) -> Self {
        let total = self.as_usec() + delta.0;
        Self { sec: (total / USEC_PER_SEC) as u32, usec: (total % USEC_PER_SEC) as u32 }
    }

    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_overflowing_usec() {
        let tv = Timeval::new(1, 2_500_000);
        assert_eq!(tv, Timeval { sec: 3, usec: 500_000 });
    }

    #[test]
    fn since_is_directional() {
        let a = Timeval::new(10, 0);
        let b = a.add_usec(MicroSeconds(1500));
        assert_eq!(b.since(a), MicroSeconds(1500));
        assert_eq!(a.since(b), MicroSeconds::ZERO);
    }

    #[test]
    fn ordering_follows_fields() {
        let a = Timeval::new(5, 999_999);
        let b = Timeval::new(6, 0);
        assert!(a < b);
    }
}
