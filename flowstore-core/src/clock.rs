//! Lamport clock primitives.
//!
//! Every message that crosses the replication channel carries a
//! [`LogicalTimestamp`], and the per-device [`LogicalClock`] is advanced on
//! both send and receive. This totally orders all cross-node operations
//! touching a bucket without relying on wall clocks.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A monotonically increasing logical timestamp.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogicalTimestamp(u64);

impl LogicalTimestamp {
    /// Create a timestamp from a raw counter value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw counter value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Whether this timestamp is strictly newer than `other`.
    #[must_use]
    pub fn is_newer_than(self, other: Self) -> bool {
        self > other
    }

    /// Whether this timestamp is strictly older than `other`.
    #[must_use]
    pub fn is_older_than(self, other: Self) -> bool {
        self < other
    }
}

/// A value paired with the logical time at which it was captured.
///
/// This is the transit envelope for every request and response on the
/// replication channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamped<T> {
    value: T,
    timestamp: LogicalTimestamp,
}

impl<T> Timestamped<T> {
    /// Wrap a value with the given timestamp.
    #[must_use]
    pub const fn new(value: T, timestamp: LogicalTimestamp) -> Self {
        Self { value, timestamp }
    }

    /// The timestamp at which the value was captured.
    #[must_use]
    pub const fn timestamp(&self) -> LogicalTimestamp {
        self.timestamp
    }

    /// A reference to the wrapped value.
    #[must_use]
    pub const fn value(&self) -> &T {
        &self.value
    }

    /// Unwrap into the value, discarding the timestamp.
    #[must_use]
    pub fn into_value(self) -> T {
        self.value
    }

    /// Unwrap into the value and its timestamp.
    #[must_use]
    pub fn into_parts(self) -> (T, LogicalTimestamp) {
        (self.value, self.timestamp)
    }
}

/// A thread-safe Lamport clock, scoped to one device flow table.
///
/// Safe for concurrent increment from multiple tasks; all updates are
/// single atomic compare-and-swap loops.
#[derive(Debug, Default)]
pub struct LogicalClock {
    time: AtomicU64,
}

impl LogicalClock {
    /// Create a clock starting at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current time, without advancing the clock.
    #[must_use]
    pub fn time(&self) -> LogicalTimestamp {
        LogicalTimestamp(self.time.load(Ordering::Acquire))
    }

    /// Advance the clock to `max(local, remote) + 1` and return the new time.
    pub fn tick(&self, remote: LogicalTimestamp) -> LogicalTimestamp {
        let prev = self
            .time
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |local| {
                Some(local.max(remote.value()) + 1)
            });
        let prev = match prev {
            Ok(prev) | Err(prev) => prev,
        };
        LogicalTimestamp(prev.max(remote.value()) + 1)
    }

    /// Increment the clock and return the new time.
    pub fn increment(&self) -> LogicalTimestamp {
        LogicalTimestamp(self.time.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Capture a value at a freshly incremented time.
    pub fn timestamp<T>(&self, value: T) -> Timestamped<T> {
        Timestamped::new(value, self.increment())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_is_monotonic() {
        let clock = LogicalClock::new();
        let a = clock.increment();
        let b = clock.increment();
        assert!(b.is_newer_than(a));
        assert_eq!(b.value(), a.value() + 1);
    }

    #[test]
    fn tick_merges_remote_time() {
        let clock = LogicalClock::new();
        clock.increment();
        let merged = clock.tick(LogicalTimestamp::new(10));
        assert_eq!(merged, LogicalTimestamp::new(11));
        assert_eq!(clock.time(), LogicalTimestamp::new(11));
    }

    #[test]
    fn tick_with_older_remote_still_advances() {
        let clock = LogicalClock::new();
        let local = clock.tick(LogicalTimestamp::new(5));
        let next = clock.tick(LogicalTimestamp::new(2));
        assert!(next.is_newer_than(local));
        assert_eq!(next.value(), local.value() + 1);
    }

    #[test]
    fn timestamp_captures_fresh_time() {
        let clock = LogicalClock::new();
        let stamped = clock.timestamp("payload");
        assert_eq!(stamped.timestamp(), LogicalTimestamp::new(1));
        assert_eq!(*stamped.value(), "payload");
    }

    #[test]
    fn concurrent_increments_never_collide() {
        use std::sync::Arc;

        let clock = Arc::new(LogicalClock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || (0..1000).map(|_| clock.increment()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }
}
