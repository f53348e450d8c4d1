pub mod error;

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeZone, Utc};

/// Returns the current unix timestamp in milliseconds.
pub fn millis_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or_default()
}

/// Converts unix milliseconds into a UTC datetime, clamping out-of-range values to the epoch.
pub fn millis_to_datetime(millis: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis as i64)
        .single()
        .unwrap_or_default()
}

pub fn datetime_to_millis(datetime: DateTime<Utc>) -> u64 {
    datetime.timestamp_millis().max(0) as u64
}
