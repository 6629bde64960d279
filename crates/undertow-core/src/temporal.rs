//! Time expression parsing for time-bounded knowledge searches.
//!
//! Accepts:
//! - RFC 3339 with timezone: `2024-01-15T10:30:00Z`
//! - ISO 8601 without timezone (assumes UTC): `2024-01-15T10:30:00`
//! - Date only (assumes midnight UTC): `2024-01-15`
//! - Relative shorthand: `7d`, `1w`, `2h`, `30min`
//! - Natural language: `now`, `today`, `yesterday`, `day before yesterday`
//! - Named periods: `last week`, `last month`, `last year`, `this week`, `this month`, `this year`
//! - N units ago: `3 days ago`, `2 weeks ago`, `1 hour ago`
//!
//! All functions take an explicit `now` so callers (and tests) control the clock.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};

use crate::defaults::TIME_SEARCH_FALLBACK_DAYS;

/// Parse a time expression relative to `now`.
///
/// Returns `None` when the expression is empty or not understood.
pub fn parse_time_expression(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let s_lower = s.to_lowercase();

    match s_lower.as_str() {
        "now" => return Some(now),
        "today" => return start_of_day(now.date_naive()),
        "yesterday" => return start_of_day(now.date_naive() - Duration::days(1)),
        "day before yesterday" => return start_of_day(now.date_naive() - Duration::days(2)),
        "last week" | "past week" => return Some(now - Duration::weeks(1)),
        "last month" | "past month" => return Some(now - Duration::days(30)),
        "last year" | "past year" => return Some(now - Duration::days(365)),
        "this week" => {
            let weekday = now.weekday().num_days_from_monday();
            return start_of_day(now.date_naive() - Duration::days(weekday as i64));
        }
        "this month" => {
            return NaiveDate::from_ymd_opt(now.year(), now.month(), 1).and_then(start_of_day);
        }
        "this year" => return NaiveDate::from_ymd_opt(now.year(), 1, 1).and_then(start_of_day),
        _ => {}
    }

    // "N units ago" - e.g. "3 days ago", "2 weeks ago"
    if let Some(without_ago) = s_lower.strip_suffix(" ago") {
        let parts: Vec<&str> = without_ago.split_whitespace().collect();
        if parts.len() == 2 {
            let num = parts[0].parse::<i64>().ok()?;
            return unit_duration(parts[1], num).map(|d| now - d);
        }
        return None;
    }

    if let Some(dt) = parse_relative_shorthand(&s_lower, now) {
        return Some(dt);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return start_of_day(date);
    }

    // Space-separated variant some clients send: 2024-01-15 10:30:00Z
    let normalized = s.replace(' ', "T");
    DateTime::parse_from_rfc3339(&normalized)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Resolve the lower bound of a time-range search.
///
/// Missing or unparseable input falls back to seven days before `now`.
pub fn resolve_since(since: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    since
        .and_then(|s| parse_time_expression(s, now))
        .unwrap_or_else(|| now - Duration::days(TIME_SEARCH_FALLBACK_DAYS))
}

fn start_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0).map(|n| n.and_utc())
}

fn unit_duration(unit: &str, num: i64) -> Option<Duration> {
    let duration = match unit {
        "min" | "mins" | "minute" | "minutes" => Duration::minutes(num),
        "h" | "hr" | "hrs" | "hour" | "hours" => Duration::hours(num),
        "d" | "day" | "days" => Duration::days(num),
        "w" | "wk" | "week" | "weeks" => Duration::weeks(num),
        "m" | "mo" | "month" | "months" => Duration::days(num * 30),
        "y" | "yr" | "year" | "years" => Duration::days(num * 365),
        _ => return None,
    };
    Some(duration)
}

/// Parse relative time shorthand (e.g. "7d", "1w", "2h", "30min").
fn parse_relative_shorthand(s: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    if split == 0 {
        return None;
    }
    let (num_str, unit) = s.split_at(split);
    let num: i64 = num_str.parse().ok()?;
    unit_duration(unit.trim(), num).map(|d| now - d)
}
