use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use crate::models::partition::MonthBucket;

/// Start of the given local calendar month, as a UTC instant.
///
/// A month that starts inside a DST gap begins at the first valid local
/// instant after midnight.
pub fn month_start(year: i32, month: u32, tz: &Tz) -> DateTime<Utc> {
    let midnight = NaiveDate::from_ymd_opt(year, month, 1)
        .unwrap_or(NaiveDate::MIN)
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default();
    let mut local = midnight;
    for _ in 0..4 {
        if let Some(resolved) = tz.from_local_datetime(&local).earliest() {
            return resolved.with_timezone(&Utc);
        }
        local += Duration::minutes(30);
    }
    Utc.from_utc_datetime(&midnight)
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

/// The month bucket holding `ts`, with boundaries in the configured timezone.
pub fn bucket_for(ts: DateTime<Utc>, tz: &Tz) -> MonthBucket {
    let local = ts.with_timezone(tz);
    bucket_of_month(local.year(), local.month(), tz)
}

fn bucket_of_month(year: i32, month: u32, tz: &Tz) -> MonthBucket {
    let (next_year, next) = next_month(year, month);
    MonthBucket {
        year,
        month,
        start: month_start(year, month, tz),
        end: month_start(next_year, next, tz),
    }
}

/// The bucket holding `now` followed by `lookahead` future buckets.
pub fn lookahead_buckets(now: DateTime<Utc>, lookahead: u32, tz: &Tz) -> Vec<MonthBucket> {
    let current = bucket_for(now, tz);
    let mut buckets = Vec::with_capacity(lookahead as usize + 1);
    let (mut year, mut month) = (current.year, current.month);
    buckets.push(current);
    for _ in 0..lookahead {
        (year, month) = next_month(year, month);
        buckets.push(bucket_of_month(year, month, tz));
    }
    buckets
}
