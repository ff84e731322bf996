//! ISO-8601 timestamp helpers.
//!
//! All timestamps in the cache are naive UTC strings with microsecond
//! precision, which sort lexicographically in chronological order and
//! compare correctly against bare `YYYY-MM-DD` date bounds.

use std::time::SystemTime;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// A system time as naive UTC.
pub fn to_naive(time: SystemTime) -> NaiveDateTime {
    let dt: DateTime<Utc> = time.into();
    dt.naive_utc()
}

/// Format a system time as a cache timestamp.
pub fn to_iso(time: SystemTime) -> String {
    to_naive(time).format(ISO_FORMAT).to_string()
}

/// Current time as a cache timestamp.
pub fn now_iso() -> String {
    Utc::now().naive_utc().format(ISO_FORMAT).to_string()
}

/// Parse a cache timestamp. Accepts values with or without fractional
/// seconds and with a space separator, as written by older caches.
pub fn parse_iso(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
}

/// Lower bound for a date filter (inclusive).
pub fn date_lower_bound(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Upper bound for a date filter: the day after `date`, used exclusively.
pub fn date_upper_bound(date: NaiveDate) -> String {
    date.succ_opt()
        .unwrap_or(NaiveDate::MAX)
        .format("%Y-%m-%d")
        .to_string()
}
