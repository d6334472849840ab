//! Timestamp utilities

use chrono::{DateTime, Duration, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Whole seconds elapsed between `since` and `now`, clamped at zero
pub fn elapsed_secs(since: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - since).num_seconds().max(0) as u64
}

/// True when more than `threshold_secs` separate `since` from `now`
pub fn is_older_than(since: DateTime<Utc>, now: DateTime<Utc>, threshold_secs: u64) -> bool {
    let threshold = i64::try_from(threshold_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX);
    now - since > threshold
}
