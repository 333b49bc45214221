use std::sync::OnceLock;

use chrono::{DateTime, Days, Local, NaiveDate, NaiveDateTime, Timelike, Utc};
use chrono_tz::Tz;
use regex::Regex;
use tracing::warn;

fn day_key_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$").ok())
        .as_ref()
}

fn hour_key_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(0\d|1\d|2[0-3])$").ok())
        .as_ref()
}

/// Parse an IANA zone name. Unknown names fall back to the host zone with a warning.
pub fn resolve_time_zone(name: Option<&str>) -> Option<Tz> {
    let name = name.map(str::trim).filter(|s| !s.is_empty())?;
    match name.parse::<Tz>() {
        Ok(tz) => Some(tz),
        Err(err) => {
            warn!("invalid time_zone {:?} ({}); using host local time", name, err);
            None
        }
    }
}

fn local_datetime(unix_seconds: i64, time_zone: Option<Tz>) -> Option<NaiveDateTime> {
    let utc = DateTime::<Utc>::from_timestamp(unix_seconds, 0)?;
    Some(match time_zone {
        Some(tz) => utc.with_timezone(&tz).naive_local(),
        None => utc.with_timezone(&Local).naive_local(),
    })
}

/// `YYYY-MM-DD` in `time_zone`, or the host zone when `None`. Day keys sort lexicographically
/// in calendar order.
pub fn day_key_from_unix_seconds(unix_seconds: i64, time_zone: Option<Tz>) -> Option<String> {
    local_datetime(unix_seconds, time_zone).map(|dt| format_day_key(dt.date()))
}

pub fn hour_key_from_unix_seconds(unix_seconds: i64, time_zone: Option<Tz>) -> Option<String> {
    local_datetime(unix_seconds, time_zone).map(|dt| format!("{:02}", dt.hour()))
}

pub fn format_day_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn parse_day_key(day_key: &str) -> Option<NaiveDate> {
    let caps = day_key_regex()?.captures(day_key)?;
    let year = caps[1].parse::<i32>().ok()?;
    let month = caps[2].parse::<u32>().ok()?;
    let day = caps[3].parse::<u32>().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

pub fn is_day_key(value: &str) -> bool {
    parse_day_key(value).is_some()
}

pub fn is_hour_key(value: &str) -> bool {
    hour_key_regex().is_some_and(|re| re.is_match(value))
}

pub fn subtract_days_from_day_key(day_key: &str, days: u64) -> Option<String> {
    let date = parse_day_key(day_key)?;
    date.checked_sub_days(Days::new(days)).map(format_day_key)
}

/// Earliest day key kept for a retention window of `retention_days` (today counts as one day).
pub fn retention_cutoff_day_key(
    retention_days: u32,
    now_unix_seconds: i64,
    time_zone: Option<Tz>,
) -> Option<String> {
    let retention_days = retention_days.max(1);
    let today = day_key_from_unix_seconds(now_unix_seconds, time_zone)?;
    subtract_days_from_day_key(&today, u64::from(retention_days - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    // 2024-01-01T23:30:00Z
    const NEW_YEAR_LATE: i64 = 1_704_151_800;

    #[test]
    fn day_and_hour_keys_follow_time_zone() {
        let utc = resolve_time_zone(Some("UTC"));
        assert_eq!(
            day_key_from_unix_seconds(NEW_YEAR_LATE, utc).as_deref(),
            Some("2024-01-01")
        );
        assert_eq!(
            hour_key_from_unix_seconds(NEW_YEAR_LATE, utc).as_deref(),
            Some("23")
        );

        let shanghai = resolve_time_zone(Some("Asia/Shanghai"));
        assert_eq!(
            day_key_from_unix_seconds(NEW_YEAR_LATE, shanghai).as_deref(),
            Some("2024-01-02")
        );
        assert_eq!(
            hour_key_from_unix_seconds(NEW_YEAR_LATE, shanghai).as_deref(),
            Some("07")
        );
    }

    #[test]
    fn invalid_zone_name_falls_back_to_local() {
        assert!(resolve_time_zone(Some("Mars/Olympus")).is_none());
        assert!(resolve_time_zone(Some("  ")).is_none());
        assert!(resolve_time_zone(None).is_none());
    }

    #[test]
    fn parses_only_real_calendar_days() {
        assert!(is_day_key("2024-02-29"));
        assert!(!is_day_key("2023-02-29"));
        assert!(!is_day_key("2024-1-01"));
        assert!(!is_day_key("bad"));
        assert!(is_hour_key("00"));
        assert!(is_hour_key("23"));
        assert!(!is_hour_key("24"));
        assert!(!is_hour_key("7"));
    }

    #[test]
    fn computes_cutoff_from_retention_days() {
        let utc = resolve_time_zone(Some("UTC"));
        assert_eq!(
            retention_cutoff_day_key(7, NEW_YEAR_LATE, utc).as_deref(),
            Some("2023-12-26")
        );
        assert_eq!(
            retention_cutoff_day_key(1, NEW_YEAR_LATE, utc).as_deref(),
            Some("2024-01-01")
        );
        assert_eq!(
            retention_cutoff_day_key(0, NEW_YEAR_LATE, utc).as_deref(),
            Some("2024-01-01"),
            "retention is at least one day"
        );
    }
}
