// src/timestamp.rs
//! Timestamp parsing, minute truncation and the wall clock used as fallback.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Naive layouts accepted after RFC 3339 fails. Interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// An event timestamp truncated to the start of its minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct MinuteKey(DateTime<Utc>);

impl<'de> Deserialize<'de> for MinuteKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        DateTime::<Utc>::deserialize(deserializer).map(truncate_to_minute)
    }
}

impl MinuteKey {
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Key `minutes` before this one. Saturates at the earliest representable time.
    pub fn minus_minutes(&self, minutes: u32) -> MinuteKey {
        let delta = TimeDelta::minutes(i64::from(minutes));
        MinuteKey(self.0.checked_sub_signed(delta).unwrap_or(DateTime::<Utc>::MIN_UTC))
    }
}

impl From<DateTime<Utc>> for MinuteKey {
    fn from(dt: DateTime<Utc>) -> Self {
        truncate_to_minute(dt)
    }
}

impl fmt::Display for MinuteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Drop seconds and sub-second precision.
pub fn truncate_to_minute(dt: DateTime<Utc>) -> MinuteKey {
    let truncated = dt
        .with_second(0)
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt);
    MinuteKey(truncated)
}

/// Parse a textual event timestamp.
///
/// Accepts RFC 3339 (any offset, converted to UTC), naive ISO-8601 with a `T`
/// or space separator (taken as UTC), and integer Unix seconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    s.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

/// Source of "now" for events whose timestamp cannot be parsed.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one instant. Handy in tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn rfc3339_with_zulu_and_offset() {
        assert_eq!(parse_timestamp("2024-05-01T10:15:30Z"), Some(utc(10, 15, 30)));
        assert_eq!(parse_timestamp("2024-05-01T12:15:30+02:00"), Some(utc(10, 15, 30)));
    }

    #[test]
    fn naive_iso_is_taken_as_utc() {
        assert_eq!(
            parse_timestamp("2024-05-01T10:15:30.123456"),
            Some(utc(10, 15, 30) + TimeDelta::microseconds(123_456))
        );
        assert_eq!(parse_timestamp("2024-05-01 10:15:30"), Some(utc(10, 15, 30)));
        assert_eq!(parse_timestamp("2024-05-01T10:15"), Some(utc(10, 15, 0)));
    }

    #[test]
    fn unix_seconds() {
        assert_eq!(parse_timestamp("1714558530"), Some(utc(10, 15, 30)));
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("   "), None);
        assert_eq!(parse_timestamp("yesterday-ish"), None);
        assert_eq!(parse_timestamp("2024-13-45T99:99:99"), None);
    }

    #[test]
    fn truncation_drops_seconds_and_fraction() {
        let dt = utc(10, 15, 59) + TimeDelta::milliseconds(999);
        let key = truncate_to_minute(dt);
        assert_eq!(key.as_datetime(), utc(10, 15, 0));
        assert_eq!(key.to_string(), "2024-05-01T10:15:00+00:00");
    }

    #[test]
    fn deserialized_key_is_truncated() {
        let key: MinuteKey = serde_json::from_str("\"2024-05-01T10:15:42.5Z\"").unwrap();
        assert_eq!(key.as_datetime(), utc(10, 15, 0));
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"2024-05-01T10:15:00Z\"");
    }

    #[test]
    fn minus_minutes_steps_back() {
        let key = truncate_to_minute(utc(10, 3, 0));
        assert_eq!(key.minus_minutes(3).as_datetime(), utc(10, 0, 0));
    }
}
