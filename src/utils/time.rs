use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime, TimeZone, Utc};

/// This is the standard way of converting a date to a usage bucket key in tabwarden.
pub fn date_to_bucket_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Parses the date prefix of a bucket key such as `2024-03-01` or `2024-03-01_general`.
/// Lifetime counters and other keys return `None`.
pub fn bucket_key_date(key: &str) -> Option<NaiveDate> {
    let date_part = key.split('_').next()?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

/// Returns the next moment strictly after `now` at which the local wall clock reads `at`.
///
/// When `at` falls into a DST gap on the target day, the first valid instant after the gap is
/// used.
pub fn next_local_occurrence(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let local_now = now.with_timezone(&Local);
    let mut day = local_now.date_naive();
    if local_now.time() >= at {
        day += Duration::days(1);
    }

    let mut candidate = day.and_time(at);
    loop {
        if let Some(resolved) = Local.from_local_datetime(&candidate).earliest() {
            return resolved.with_timezone(&Utc);
        }
        candidate += Duration::minutes(30);
    }
}

/// Returns start of the next local day.
pub fn next_local_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    next_local_occurrence(now, NaiveTime::MIN)
}

/// Converts a wall-clock delay into a [std::time::Duration], saturating at zero.
pub fn until(now: DateTime<Utc>, then: DateTime<Utc>) -> std::time::Duration {
    (then - now).to_std().unwrap_or_default()
}
