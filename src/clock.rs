//! Time sources.
//!
//! Every timestamp a [`Connection`](crate::Connection) writes and every expiry
//! the in-memory store evaluates comes from a [`Clock`]. Production code uses
//! [`SystemClock`]; tests share a [`MockClock`] between the connection and a
//! [`MemoryStore`](crate::store::MemoryStore) to make TTL behaviour deterministic.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// A source of the current UTC time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Mock clock for controlling time in tests.
///
/// The clock is frozen at its creation instant until advanced or set. Clones
/// share the same underlying time, so a clone handed to a store and one held by
/// the test always agree.
///
/// # Examples
///
/// ```rust
/// use deferwork::clock::{Clock, MockClock};
/// use chrono::Duration;
///
/// let clock = MockClock::new();
/// let start = clock.now();
///
/// clock.advance(Duration::seconds(2));
/// assert_eq!((clock.now() - start).num_seconds(), 2);
/// ```
#[derive(Clone, Debug)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a new mock clock starting at the current time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Create a mock clock frozen at `time`.
    pub fn starting_at(time: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(time)),
        }
    }

    /// Advance the mock time by the given duration.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *time += duration;
    }

    /// Set the mock time to a specific instant.
    pub fn set_time(&self, time: DateTime<Utc>) {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_mock_clock_is_frozen_until_advanced() {
        let clock = MockClock::new();
        let first = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(clock.now(), first);

        clock.advance(Duration::minutes(30));
        assert_eq!((clock.now() - first).num_minutes(), 30);
    }

    #[test]
    fn test_mock_clock_clones_share_time() {
        let clock = MockClock::new();
        let shared = clock.clone();

        clock.advance(Duration::hours(1));
        assert_eq!(clock.now(), shared.now());
    }

    #[test]
    fn test_set_time() {
        let clock = MockClock::new();
        let specific = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        clock.set_time(specific);
        assert_eq!(clock.now(), specific);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let before = Utc::now();
        assert!(clock.now() >= before);
    }
}
