//! UTC clock and timestamp helpers.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, NaiveTime, SecondsFormat, TimeDelta, Utc};

/// Source of the current time, injectable for tests.
pub trait Clock: Send + Sync {
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

/// Clock that returns a settable instant.
#[derive(Debug)]
pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    /// Builds a clock from an RFC 3339 instant.
    pub fn at(rfc3339: &str) -> Option<Self> {
        parse_rfc3339(rfc3339).map(Self::new)
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, delta: TimeDelta) {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += delta;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Midnight UTC of the day containing `now`.
pub fn utc_day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Second-precision RFC 3339 with a `Z` suffix, e.g. `2025-12-18T00:00:00Z`.
pub fn format_rfc3339(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parses any RFC 3339 timestamp into UTC.
pub fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim()).ok().map(|parsed| parsed.with_timezone(&Utc))
}

/// `YYYYMMDD-HHMMSS`, used in artifact file names.
pub fn filename_stamp(instant: DateTime<Utc>) -> String {
    instant.format("%Y%m%d-%H%M%S").to_string()
}

/// True when both instants fall on the same UTC calendar day.
pub fn same_utc_day(left: DateTime<Utc>, right: DateTime<Utc>) -> bool {
    left.date_naive() == right.date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_start_truncates_to_midnight() {
        let now = parse_rfc3339("2025-12-18T15:42:07.123Z").unwrap();
        assert_eq!(format_rfc3339(utc_day_start(now)), "2025-12-18T00:00:00Z");
    }

    #[test]
    fn offsets_are_normalized_to_utc() {
        let parsed = parse_rfc3339("2025-12-18T01:30:00+02:00").unwrap();
        assert_eq!(format_rfc3339(parsed), "2025-12-17T23:30:00Z");
        assert!(parse_rfc3339("yesterday").is_none());
    }

    #[test]
    fn filename_stamp_is_compact() {
        let now = parse_rfc3339("2025-12-18T09:05:03Z").unwrap();
        assert_eq!(filename_stamp(now), "20251218-090503");
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::at("2025-12-18T23:59:59Z").unwrap();
        clock.advance(TimeDelta::seconds(2));
        assert!(!same_utc_day(clock.now(), parse_rfc3339("2025-12-18T12:00:00Z").unwrap()));
        assert_eq!(format_rfc3339(clock.now()), "2025-12-19T00:00:01Z");
    }
}
