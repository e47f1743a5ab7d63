use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns the current Unix time as fractional seconds, the on-disk timestamp format.
pub fn current_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Renders fractional Unix seconds as an RFC 3339 string in UTC.
pub fn unix_seconds_to_rfc3339(seconds: f64) -> String {
    let micros = if seconds.is_finite() {
        (seconds * 1_000_000.0) as i64
    } else {
        0
    };
    DateTime::<Utc>::from_timestamp_micros(micros)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Returns true when `timestamp` lies strictly more than `max_age` before `now`.
pub fn is_older_than(timestamp: f64, max_age: Duration, now: f64) -> bool {
    now - timestamp > max_age.as_secs_f64()
}
