use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch for the current wall clock.
pub fn unix_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
