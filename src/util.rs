//! Small shared helpers.

use chrono::{DateTime, SecondsFormat, Utc};

/// Canonical stored timestamp: RFC 3339, UTC, millisecond precision.
///
/// Fixed width keeps lexicographic order equal to chronological order, which
/// the staleness queries rely on.
pub fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_ts() -> String {
    format_ts(Utc::now())
}

/// Parse any RFC 3339 timestamp (provider or stored) into UTC.
pub fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
