use chrono::{DateTime, NaiveDateTime};

/// Layouts tried, in order, when no override is configured.
pub const DEFAULT_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
];

/// Parse a CDR timestamp such as `"2023-04-01 00:00:12"` or `"2023/04/01 00:00:12"`.
///
/// Tries each of `formats` in turn, then RFC 3339 (offset dropped, wall-clock
/// time kept). Surrounding whitespace and quotes are ignored.
pub fn parse_timestamp<S: AsRef<str>>(s: &str, formats: &[S]) -> Option<NaiveDateTime> {
    let s = super::utils::clean_str(s);
    if s.is_empty() {
        return None;
    }
    for fmt in formats {
        if let Ok(ts) = NaiveDateTime::parse_from_str(&s, fmt.as_ref()) {
            return Some(ts);
        }
    }
    DateTime::parse_from_rfc3339(&s)
        .ok()
        .map(|dt| dt.naive_local())
}
