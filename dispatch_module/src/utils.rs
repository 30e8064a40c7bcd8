use chrono::{DateTime, Datelike, NaiveTime, SecondsFormat, TimeZone, Utc};
use rand::Rng;
use std::time::Duration;

use crate::store::StoreError;

/// Fixed-width RFC 3339 so text timestamps order lexicographically in SQLite.
pub(crate) fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(value: &str) -> Result<DateTime<Utc>, StoreError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

/// UTC midnight of the current day; the daily capacity window.
pub(crate) fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_time(NaiveTime::MIN).single().unwrap_or(now)
}

/// First instant of the current UTC calendar month; the monthly cap window.
pub(crate) fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let first = now.date_naive().with_day(1).unwrap_or(now.date_naive());
    Utc.from_utc_datetime(&first.and_time(NaiveTime::MIN))
}

/// Uniformly jitter a pacing delay within ±pct so send intervals are not
/// mechanically regular.
pub fn jitter(pace_seconds: u32, pct: f64) -> Duration {
    if pace_seconds == 0 {
        return Duration::ZERO;
    }
    let base = pace_seconds as f64;
    let span = base * pct;
    let delay = base + rand::thread_rng().gen_range(-span..=span);
    Duration::from_secs_f64(delay.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..200 {
            let delay = jitter(90, 0.2).as_secs_f64();
            assert!((72.0..=108.0).contains(&delay), "delay {} out of bounds", delay);
        }
    }

    #[test]
    fn jitter_of_zero_pace_is_zero() {
        assert_eq!(jitter(0, 0.2), Duration::ZERO);
    }

    #[test]
    fn window_starts() {
        let now = Utc.with_ymd_and_hms(2026, 8, 5, 13, 45, 12).unwrap();
        assert_eq!(day_start(now), Utc.with_ymd_and_hms(2026, 8, 5, 0, 0, 0).unwrap());
        assert_eq!(month_start(now), Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn datetime_roundtrip_is_fixed_width() {
        let now = Utc.with_ymd_and_hms(2026, 8, 5, 13, 45, 12).unwrap();
        let formatted = format_datetime(now);
        assert!(formatted.ends_with('Z'));
        assert_eq!(parse_datetime(&formatted).expect("parse"), now);
    }
}
