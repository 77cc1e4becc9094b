//! Persisted-timestamp model and monotone allocation.
//!
//! Every stored document version carries a server-assigned microsecond
//! timestamp. The value zero is reserved for "not present". Each distributor
//! stripe owns one [`TimestampSource`] so that timestamps it assigns are
//! strictly increasing even when the wall clock stalls or steps backwards.

use serde::{Deserialize, Serialize};

/// A persisted-timestamp: microseconds since the epoch.
///
/// Zero means "no stored version" and orders below every real timestamp.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// The "not present" sentinel.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Create a timestamp from raw microseconds.
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Raw microsecond value.
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Whether this timestamp denotes a stored version.
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }

    /// The next representable timestamp.
    pub const fn successor(self) -> Self {
        Self(self.0 + 1)
    }

    /// The larger of two timestamps.
    pub fn max_of(self, other: Timestamp) -> Timestamp {
        if other.0 > self.0 {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}us", self.0)
    }
}

/// Strictly monotone timestamp allocator.
///
/// Samples the wall clock on each allocation and bumps past the last issued
/// value, so two allocations from the same source never collide and never go
/// backwards.
#[derive(Debug)]
pub struct TimestampSource {
    last_issued: u64,
}

impl TimestampSource {
    /// Create a fresh source.
    pub fn new() -> Self {
        Self { last_issued: 0 }
    }

    /// Create a source that will never issue a value at or below `floor`.
    pub fn with_floor(floor: Timestamp) -> Self {
        Self {
            last_issued: floor.0,
        }
    }

    /// Allocate the next timestamp.
    pub fn next(&mut self) -> Timestamp {
        let now = wall_clock_micros();
        let issued = now.max(self.last_issued + 1);
        self.last_issued = issued;
        Timestamp(issued)
    }

    /// Allocate a timestamp strictly greater than `observed`.
    ///
    /// Used by the put phase: the new document version must order after every
    /// persisted version seen during the operation.
    pub fn next_after(&mut self, observed: Timestamp) -> Timestamp {
        if observed.0 > self.last_issued {
            self.last_issued = observed.0;
        }
        self.next()
    }

    /// The most recently issued timestamp, if any.
    pub fn last_issued(&self) -> Option<Timestamp> {
        (self.last_issued != 0).then_some(Timestamp(self.last_issued))
    }
}

impl Default for TimestampSource {
    fn default() -> Self {
        Self::new()
    }
}

fn wall_clock_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_not_set() {
        assert!(!Timestamp::ZERO.is_set());
        assert!(Timestamp::from_micros(1).is_set());
    }

    #[test]
    fn zero_orders_below_everything() {
        assert!(Timestamp::ZERO < Timestamp::from_micros(1));
        assert!(Timestamp::from_micros(5) < Timestamp::from_micros(6));
    }

    #[test]
    fn source_is_strictly_monotone() {
        let mut source = TimestampSource::new();
        let mut previous = Timestamp::ZERO;
        for _ in 0..1000 {
            let next = source.next();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn next_after_clears_observed_value() {
        let mut source = TimestampSource::new();
        let far_future = Timestamp::from_micros(u64::MAX / 2);
        let issued = source.next_after(far_future);
        assert!(issued > far_future);
    }

    #[test]
    fn floor_is_respected() {
        let mut source = TimestampSource::with_floor(Timestamp::from_micros(u64::MAX / 4));
        assert!(source.next() > Timestamp::from_micros(u64::MAX / 4));
    }
}
