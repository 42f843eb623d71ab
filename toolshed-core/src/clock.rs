//! Wall-clock abstraction.
//!
//! Entry ages and durable expiry are computed against a [`Clock`] so the
//! cache can be driven deterministically in tests. The manual clock lives in
//! `toolshed-test-utils`.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Source of the current time.
pub trait Clock: Send + Sync + 'static {
    /// The current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Add a std duration to a timestamp, saturating instead of overflowing.
pub fn add_duration(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_duration_saturates() {
        let far = DateTime::<Utc>::MAX_UTC - chrono::Duration::seconds(1);
        assert_eq!(add_duration(far, Duration::from_secs(3600)), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
