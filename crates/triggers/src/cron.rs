//! Timezone-aware cron evaluation (5-field: min hour dom month dow).

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc};

/// Parse a timezone name into a `chrono_tz::Tz`, falling back to UTC.
pub fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

/// Structural validation: five whitespace-separated fields, each `*`,
/// `*/N`, or a comma list of numbers / `N-M` ranges.
pub fn validate_expression(cron: &str) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    fields.iter().all(|field| {
        if *field == "*" {
            return true;
        }
        if let Some(step) = field.strip_prefix("*/") {
            return step.parse::<u32>().is_ok_and(|n| n > 0);
        }
        field.split(',').all(|part| {
            if let Some((a, b)) = part.split_once('-') {
                a.parse::<u32>().is_ok() && b.parse::<u32>().is_ok()
            } else {
                part.parse::<u32>().is_ok()
            }
        })
    })
}

fn field_matches(field: &str, value: u32) -> bool {
    if field == "*" {
        return true;
    }
    if let Some(step) = field.strip_prefix("*/") {
        if let Ok(n) = step.parse::<u32>() {
            return n > 0 && value % n == 0;
        }
    }
    for part in field.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start_s.parse::<u32>(), end_s.parse::<u32>()) {
                if value >= start && value <= end {
                    return true;
                }
            }
        } else if let Ok(n) = part.parse::<u32>() {
            if value == n {
                return true;
            }
        }
    }
    false
}

/// Does a **local** naive datetime match the expression?
fn matches_local(cron: &str, dt: &NaiveDateTime) -> bool {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    field_matches(fields[0], dt.minute())
        && field_matches(fields[1], dt.hour())
        && field_matches(fields[2], dt.day())
        && field_matches(fields[3], dt.month())
        && field_matches(fields[4], dt.weekday().num_days_from_sunday())
}

/// Does a UTC instant match the expression (UTC shorthand)?
pub fn matches_utc(cron: &str, dt: &DateTime<Utc>) -> bool {
    matches_local(cron, &dt.naive_utc())
}

/// Next occurrence strictly after `after`, evaluated in `tz`; returned in
/// UTC.
///
/// **DST handling:**
/// - Spring-forward gaps: local minutes that do not exist are skipped.
/// - Fall-back overlaps: the earliest (pre-transition) mapping is chosen.
pub fn next_occurrence(
    cron: &str,
    after: &DateTime<Utc>,
    tz: chrono_tz::Tz,
) -> Option<DateTime<Utc>> {
    use chrono::TimeZone;

    // Advance to the next whole local minute.
    let local_after = after.with_timezone(&tz).naive_local();
    let to_next_minute = 60 - i64::from(local_after.second());
    let mut candidate = local_after + chrono::Duration::seconds(to_next_minute);
    candidate = candidate.with_second(0).unwrap_or(candidate);

    let max_checks = 366 * 24 * 60; // one year of minutes
    for _ in 0..max_checks {
        if matches_local(cron, &candidate) {
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                chrono::LocalResult::Ambiguous(earliest, _) => {
                    return Some(earliest.with_timezone(&Utc));
                }
                chrono::LocalResult::None => {
                    // DST gap; this local minute does not exist.
                }
            }
        }
        candidate += chrono::Duration::minutes(1);
    }
    None
}

/// All occurrences in the half-open window `(after, until]`, capped at
/// `limit`. Used to discover missed windows on catch-up.
pub fn occurrences_between(
    cron: &str,
    after: &DateTime<Utc>,
    until: &DateTime<Utc>,
    tz: chrono_tz::Tz,
    limit: usize,
) -> Vec<DateTime<Utc>> {
    let mut out = Vec::new();
    let mut cursor = *after;
    while out.len() < limit {
        match next_occurrence(cron, &cursor, tz) {
            Some(next) if next <= *until => {
                out.push(next);
                cursor = next;
            }
            _ => break,
        }
    }
    out
}
