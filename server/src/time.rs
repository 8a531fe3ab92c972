use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Current wall-clock time. Centralized so tests can be written against
/// fixed instants without reaching into `chrono::Utc::now()` everywhere.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Today's calendar day (`YYYY-MM-DD`) in `tz`, used as a Batch's
/// `batch_date` and as the daily-seal scheduler's cutoff (spec.md §3,
/// `DAILY_SEAL_TZ`).
pub fn logical_day(tz: &Tz) -> String {
    logical_day_at(tz, now())
}

pub fn logical_day_at(tz: &Tz, at: DateTime<Utc>) -> String {
    at.with_timezone(tz).format("%Y-%m-%d").to_string()
}
