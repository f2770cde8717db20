//! Timestamp parsing and "time ago" labels for conversation previews

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

/// Parse a backend timestamp. Accepts RFC 3339 and zone-less ISO local
/// date-times, which are read in the local time zone.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc))
}

/// Human label for the distance between `then` and `now`, e.g. "5 minutes ago".
pub fn relative_label(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - then).num_seconds();
    let phrase = distance_phrase(seconds.unsigned_abs() as f64);
    if seconds < 0 {
        format!("in {phrase}")
    } else {
        format!("{phrase} ago")
    }
}

fn distance_phrase(seconds: f64) -> String {
    let minutes = seconds / 60.0;
    let hours = minutes / 60.0;
    let days = hours / 24.0;

    if seconds < 45.0 {
        "a few seconds".to_string()
    } else if seconds < 90.0 {
        "a minute".to_string()
    } else if minutes < 45.0 {
        format!("{} minutes", minutes.round() as u64)
    } else if minutes < 90.0 {
        "an hour".to_string()
    } else if hours < 22.0 {
        format!("{} hours", hours.round() as u64)
    } else if hours < 36.0 {
        "a day".to_string()
    } else if days < 26.0 {
        format!("{} days", days.round() as u64)
    } else if days < 45.0 {
        "a month".to_string()
    } else if days < 320.0 {
        format!("{} months", (days / 30.0).round() as u64)
    } else if days < 548.0 {
        "a year".to_string()
    } else {
        format!("{} years", (days / 365.0).round() as u64)
    }
}
