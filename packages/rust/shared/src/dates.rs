//! Date sanitizing for recap headers.
//!
//! Recap pages print dates as free text ("Saturday, March 15, 2025"). Anything
//! that does not parse to a plausible calendar date is dropped, so the store
//! never receives an invalid timestamp.

use chrono::{DateTime, Datelike, NaiveDate, Utc};

/// Date layouts seen on recap pages, tried in order.
const DATE_FORMATS: &[&str] = &[
    "%A, %B %d, %Y",
    "%A %B %d, %Y",
    "%B %d, %Y",
    "%B %d %Y",
    "%d %B %Y",
    "%m/%d/%Y",
    "%Y-%m-%d",
];

/// Years outside this range are treated as parse garbage.
const YEAR_RANGE: std::ops::RangeInclusive<i32> = 1900..=2200;

/// Parse recap date text into a UTC timestamp, or `None` if it is unusable.
pub fn sanitize_date(raw: &str) -> Option<DateTime<Utc>> {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        return None;
    }

    let parsed = DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            DATE_FORMATS.iter().find_map(|fmt| {
                NaiveDate::parse_from_str(&text, fmt)
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|naive| naive.and_utc())
            })
        })?;

    YEAR_RANGE.contains(&parsed.year()).then_some(parsed)
}
