use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Datelike, TimeZone, Utc};

pub const MINUTE_MS: u64 = 60 * 1000;
pub const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Injectable time source so tests can drive the clock.
pub trait TimeSource: Send + Sync {
    /// Current time in epoch milliseconds (UTC)
    fn now_ms(&self) -> u64;
}

pub type SharedClock = Arc<dyn TimeSource>;

/// Wall-clock time source used in production.
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }
}

/// UTC-aligned minute bucket. A timestamp exactly on a boundary
/// belongs to the new bucket.
pub fn minute_bucket(now_ms: u64) -> u64 {
    now_ms / MINUTE_MS
}

/// UTC-aligned day bucket (days since epoch).
pub fn day_bucket(now_ms: u64) -> u64 {
    now_ms / DAY_MS
}

pub fn day_start_ms(now_ms: u64) -> u64 {
    (now_ms / DAY_MS) * DAY_MS
}

fn utc(now_ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(now_ms as i64)
        .single()
        .unwrap_or_default()
}

/// Calendar (year, month) of a timestamp; billing cycles are UTC months.
pub fn year_month(now_ms: u64) -> (i32, u32) {
    let dt = utc(now_ms);
    (dt.year(), dt.month())
}

/// Start of the UTC calendar month containing `now_ms`.
pub fn month_start_ms(now_ms: u64) -> u64 {
    let (year, month) = year_month(now_ms);
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp_millis() as u64)
        .unwrap_or(0)
}

/// Whether two timestamps fall in the same billing cycle (UTC month).
pub fn same_cycle(a_ms: u64, b_ms: u64) -> bool {
    year_month(a_ms) == year_month(b_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_belongs_to_new_bucket() {
        assert_eq!(minute_bucket(MINUTE_MS - 1), 0);
        assert_eq!(minute_bucket(MINUTE_MS), 1);
        assert_eq!(day_bucket(DAY_MS - 1), 0);
        assert_eq!(day_bucket(DAY_MS), 1);
    }

    #[test]
    fn month_math() {
        // 2024-03-15 12:00:00 UTC
        let ts = Utc
            .with_ymd_and_hms(2024, 3, 15, 12, 0, 0)
            .unwrap()
            .timestamp_millis() as u64;
        assert_eq!(year_month(ts), (2024, 3));
        let start = Utc
            .with_ymd_and_hms(2024, 3, 1, 0, 0, 0)
            .unwrap()
            .timestamp_millis() as u64;
        assert_eq!(month_start_ms(ts), start);

        let next = Utc
            .with_ymd_and_hms(2024, 4, 1, 0, 0, 0)
            .unwrap()
            .timestamp_millis() as u64;
        assert!(same_cycle(ts, start));
        assert!(!same_cycle(ts, next));
    }
}
