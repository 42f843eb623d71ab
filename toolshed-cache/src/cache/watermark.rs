//! Invalidation watermark for rejecting late writes.
//!
//! Every invalidation takes the next sequence number and is logged together
//! with the key or pattern it removed. A fetch or refresh takes a
//! [`WriteTicket`] before it starts; when it settles, the store only accepts
//! the write if no invalidation logged after the ticket covers the key, and
//! no newer value was written for the key after the ticket was issued.
//!
//! Only the most recent invalidations are kept. A ticket issued before the
//! oldest retained record cannot be checked and is rejected.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use toolshed_core::constants::INVALIDATION_LOG_CAPACITY;

use super::key::{CacheKey, Invalidation};

/// A point in the invalidation history.
///
/// Watermarks are monotonically increasing and can be compared to determine
/// if invalidations have occurred between two points in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Watermark(u64);

impl Watermark {
    /// The watermark before any invalidation.
    pub fn zero() -> Self {
        Self(0)
    }

    /// The raw sequence number.
    pub fn sequence(&self) -> u64 {
        self.0
    }

    /// Check if this watermark is newer than another.
    pub fn is_newer_than(&self, other: &Watermark) -> bool {
        self.0 > other.0
    }
}

struct Record {
    watermark: Watermark,
    target: Invalidation,
}

#[derive(Default)]
struct InvalidationLog {
    records: VecDeque<Record>,
    /// Watermark of the newest record dropped from the log.
    horizon: Watermark,
}

/// Invalidation history shared by one store.
pub struct InvalidationWatermark {
    sequence: AtomicU64,
    log: Mutex<InvalidationLog>,
    capacity: usize,
}

impl Default for InvalidationWatermark {
    fn default() -> Self {
        Self::new()
    }
}

impl InvalidationWatermark {
    pub fn new() -> Self {
        Self::with_capacity(INVALIDATION_LOG_CAPACITY)
    }

    /// Keep at most `capacity` invalidations (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sequence: AtomicU64::new(0),
            log: Mutex::new(InvalidationLog::default()),
            capacity: capacity.max(1),
        }
    }

    fn log(&self) -> MutexGuard<'_, InvalidationLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current watermark.
    pub fn current(&self) -> Watermark {
        Watermark(self.sequence.load(Ordering::Acquire))
    }

    /// Record an invalidation and return its watermark.
    pub fn advance(&self, target: Invalidation) -> Watermark {
        let mut log = self.log();
        let watermark = Watermark(self.sequence.fetch_add(1, Ordering::AcqRel) + 1);
        log.records.push_back(Record { watermark, target });
        while log.records.len() > self.capacity {
            if let Some(dropped) = log.records.pop_front() {
                log.horizon = dropped.watermark;
            }
        }
        watermark
    }

    /// Issue a ticket for a write that starts now.
    pub fn ticket(&self, issued_at: DateTime<Utc>) -> WriteTicket {
        WriteTicket {
            watermark: self.current(),
            issued_at,
        }
    }

    /// Check whether a write of `key` under `ticket` is still allowed.
    pub fn admits(&self, key: &CacheKey, ticket: &WriteTicket) -> bool {
        let log = self.log();
        if log.horizon.is_newer_than(&ticket.watermark) {
            return false;
        }
        !log.records
            .iter()
            .rev()
            .take_while(|record| record.watermark.is_newer_than(&ticket.watermark))
            .any(|record| record.target.covers(key))
    }

    /// Number of invalidations currently retained.
    pub fn retained(&self) -> usize {
        self.log().records.len()
    }
}

/// Proof that a write was started at a given point in the invalidation
/// history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTicket {
    /// Watermark observed when the write began.
    pub watermark: Watermark,
    /// When the write began, per the store's clock.
    pub issued_at: DateTime<Utc>,
}

impl WriteTicket {
    /// Whether an existing entry written at `created_at` should win over this
    /// write.
    pub fn is_superseded_by(&self, created_at: DateTime<Utc>) -> bool {
        created_at > self.issued_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::KeyPattern;

    fn key(raw: &str) -> CacheKey {
        CacheKey::from(raw)
    }

    fn pattern(raw: &str) -> Invalidation {
        Invalidation::Pattern(KeyPattern::new(raw).unwrap())
    }

    #[test]
    fn test_watermark_ordering() {
        let w1 = Watermark(1);
        let w2 = Watermark(2);
        assert!(w2.is_newer_than(&w1));
        assert!(!w1.is_newer_than(&w2));
        assert!(!w1.is_newer_than(&w1));
        assert_eq!(Watermark::zero().sequence(), 0);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let wm = InvalidationWatermark::new();
        let a = wm.advance(Invalidation::Key(key("a")));
        let b = wm.advance(Invalidation::Key(key("b")));
        assert!(b.is_newer_than(&a));
        assert_eq!(wm.current(), b);
    }

    #[test]
    fn test_ticket_rejected_after_invalidating_its_key() {
        let wm = InvalidationWatermark::new();
        let ticket = wm.ticket(Utc::now());
        assert!(wm.admits(&key("a"), &ticket));

        wm.advance(Invalidation::Key(key("a")));
        assert!(!wm.admits(&key("a"), &ticket));
        assert!(wm.admits(&key("a"), &wm.ticket(Utc::now())));
    }

    #[test]
    fn test_unrelated_invalidation_admits_ticket() {
        let wm = InvalidationWatermark::new();
        let ticket = wm.ticket(Utc::now());

        wm.advance(Invalidation::Key(key("categories:{}")));
        wm.advance(pattern("categories:*"));

        assert!(wm.admits(&key("tools:{}"), &ticket));
        assert!(!wm.admits(&key("categories:{}"), &ticket));
    }

    #[test]
    fn test_pattern_covers_keys_never_cached() {
        let wm = InvalidationWatermark::new();
        let ticket = wm.ticket(Utc::now());
        wm.advance(pattern("tools:*"));

        assert!(!wm.admits(&key(r#"tools:{"page":9}"#), &ticket));
        assert!(wm.admits(&key("tool:{}"), &ticket));
    }

    #[test]
    fn test_ticket_older_than_retained_history_is_rejected() {
        let wm = InvalidationWatermark::with_capacity(2);
        let old = wm.ticket(Utc::now());
        wm.advance(Invalidation::Key(key("x")));
        let recent = wm.ticket(Utc::now());
        wm.advance(Invalidation::Key(key("y")));
        wm.advance(Invalidation::Key(key("z")));

        assert_eq!(wm.retained(), 2);
        assert!(!wm.admits(&key("a"), &old));
        assert!(wm.admits(&key("a"), &recent));
    }

    #[test]
    fn test_ticket_superseded_by_newer_write() {
        let t0 = Utc::now();
        let wm = InvalidationWatermark::new();
        let ticket = wm.ticket(t0);
        assert!(!ticket.is_superseded_by(t0));
        assert!(ticket.is_superseded_by(t0 + chrono::Duration::milliseconds(1)));
    }
}
