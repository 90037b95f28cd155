//! Time source for the controller
//!
//! Every timestamp decision (pause expiry, scale-down delays, progress
//! deadlines, analysis intervals) reads the current time through the
//! [`Clock`] trait carried in the reconcile contexts, so tests can pin and
//! step time instead of sleeping. Persisted timestamps are RFC3339 strings;
//! the helpers here are the one place they are parsed back.

use chrono::{DateTime, Utc};

/// Source of "now" for reconcile logic
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock used in production
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Parse an RFC3339 timestamp as written by this controller.
///
/// Returns None on malformed input; callers treat a missing timestamp and an
/// unparseable one the same way.
pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Seconds elapsed since `since`, given `now`. Negative when `since` lies in
/// the future (clock skew between writers); callers clamp as needed.
pub fn seconds_since(since: &str, now: DateTime<Utc>) -> Option<i64> {
    parse_rfc3339(since).map(|start| now.signed_duration_since(start).num_seconds())
}

/// Test clock pinned to an instant that tests move explicitly.
///
/// The instant lives in an atomic nanosecond counter, so the clock can be
/// shared through an `Arc` and stepped from the outside without locking.
#[cfg(test)]
pub struct MockClock {
    epoch_nanos: std::sync::atomic::AtomicI64,
}

#[cfg(test)]
impl MockClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            epoch_nanos: std::sync::atomic::AtomicI64::new(
                start.timestamp_nanos_opt().unwrap_or_default(),
            ),
        }
    }

    /// Move the clock forward (or, with a negative duration, back)
    pub fn advance(&self, by: chrono::Duration) {
        self.epoch_nanos.fetch_add(
            by.num_nanoseconds().unwrap_or_default(),
            std::sync::atomic::Ordering::SeqCst,
        );
    }
}

#[cfg(test)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(
            self.epoch_nanos.load(std::sync::atomic::Ordering::SeqCst),
        )
    }
}
