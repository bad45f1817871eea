//! Poll interval derived from the daily request quota.

use std::time::Duration;

const SECONDS_PER_DAY: i64 = 24 * 3600;

/// Provider-mandated minimum spacing between requests.
pub const MIN_INTERVAL_SECS: u64 = 10 * 60;

/// Used when the configured quota is zero or negative.
pub const FALLBACK_INTERVAL_SECS: u64 = 15 * 60;

/// Seconds between polls for a given daily quota.
pub fn update_interval_secs(max_daily_requests: i64) -> u64 {
    if max_daily_requests <= 0 {
        return FALLBACK_INTERVAL_SECS;
    }
    let spread = (SECONDS_PER_DAY / max_daily_requests) as u64;
    spread.max(MIN_INTERVAL_SECS)
}

pub fn update_interval(max_daily_requests: i64) -> Duration {
    Duration::from_secs(update_interval_secs(max_daily_requests))
}
