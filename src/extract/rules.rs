//! Keyword/regex fallback extraction, used when the LLM is unavailable or
//! returns something that fails schema validation.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::Priority;

static HIGH_PRIORITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(urgent|asap|critical|eod|important)\b").unwrap());
static LOW_PRIORITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(fyi|optional|tentative|maybe)\b").unwrap());
static CRITICAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(critical|must|required)\b").unwrap());
static URGENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(urgent|asap)\b").unwrap());
static BY_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bby\s+(\d{4}-\d{2}-\d{2})\b").unwrap());
static EOD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\beod\b").unwrap());

/// Explicit priority hint from free text, if any.
pub fn priority_hint(text: &str) -> Option<Priority> {
    if HIGH_PRIORITY.is_match(text) {
        Some(Priority::High)
    } else if LOW_PRIORITY.is_match(text) {
        Some(Priority::Low)
    } else {
        None
    }
}

pub fn is_critical_hint(text: &str) -> bool {
    CRITICAL.is_match(text)
}

pub fn is_urgent_hint(text: &str) -> bool {
    URGENT.is_match(text)
}

/// Deadline mentioned in free text: "by 2025-11-08" or "eod".
pub fn deadline_hint(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(caps) = BY_DATE.captures(text) {
        if let Ok(date) = caps[1].parse::<NaiveDate>() {
            return date
                .and_hms_opt(17, 0, 0)
                .map(|naive| Utc.from_utc_datetime(&naive));
        }
    }
    if EOD.is_match(text) {
        return now
            .date_naive()
            .and_hms_opt(17, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive));
    }
    None
}

/// Final priority per the mapping rules: explicit high keywords or a
/// deadline within 24h raise to high; explicit low keywords lower; the rest
/// stay normal.
pub fn map_priority(
    hint: Option<Priority>,
    deadline: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Priority {
    if hint == Some(Priority::High) {
        return Priority::High;
    }
    if let Some(deadline) = deadline {
        if deadline > now && deadline - now <= chrono::Duration::hours(24) {
            return Priority::High;
        }
    }
    hint.unwrap_or(Priority::Normal)
}
