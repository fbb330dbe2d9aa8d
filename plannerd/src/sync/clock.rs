use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, Time};

/// Current UTC time truncated to milliseconds, the resolution timestamps are stored at.
pub fn now_utc() -> OffsetDateTime {
    truncate_millis(OffsetDateTime::now_utc())
}

pub fn truncate_millis(at: OffsetDateTime) -> OffsetDateTime {
    at.replace_millisecond(at.millisecond()).unwrap_or(at)
}

pub fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_millis(ms: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()
}

pub fn parse_rfc3339(value: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value.trim(), &Rfc3339)
        .ok()
        .map(|at| truncate_millis(at.to_offset(time::UtcOffset::UTC)))
}

pub fn format_rfc3339(at: OffsetDateTime) -> String {
    at.to_offset(time::UtcOffset::UTC)
        .format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// `at` moved back by `days`, or `None` for negative or out-of-range spans.
pub fn days_before(at: OffsetDateTime, days: i64) -> Option<OffsetDateTime> {
    if days < 0 {
        return None;
    }
    let secs = days.checked_mul(86_400)?;
    at.checked_sub(Duration::seconds(secs))
}

/// `at` moved forward by `minutes`, or `None` when the result is out of range.
pub fn minutes_after(at: OffsetDateTime, minutes: i64) -> Option<OffsetDateTime> {
    let secs = minutes.checked_mul(60)?;
    at.checked_add(Duration::seconds(secs))
}

/// All-day values (`YYYY-MM-DD`) resolve to midnight UTC.
pub fn parse_date(value: &str) -> Option<OffsetDateTime> {
    let date = Date::parse(value.trim(), format_description!("[year]-[month]-[day]")).ok()?;
    Some(date.with_time(Time::MIDNIGHT).assume_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn millis_round_trip_through_storage_resolution() {
        let at = datetime!(2025-03-01 09:30:15.123 UTC);
        assert_eq!(from_millis(to_millis(at)), Some(at));
    }

    #[test]
    fn parses_remote_timestamps_in_any_offset() {
        assert_eq!(
            parse_rfc3339("2025-03-01T10:00:00.250+01:00"),
            Some(datetime!(2025-03-01 09:00:00.250 UTC))
        );
        assert_eq!(parse_rfc3339("yesterday"), None);
    }

    #[test]
    fn window_arithmetic_rejects_out_of_range_spans() {
        let at = datetime!(2025-03-01 09:00 UTC);
        assert_eq!(days_before(at, 2), Some(datetime!(2025-02-27 09:00 UTC)));
        assert_eq!(days_before(at, -1), None);
        assert_eq!(days_before(at, i64::MAX), None);
        assert_eq!(minutes_after(at, 90), Some(datetime!(2025-03-01 10:30 UTC)));
        assert_eq!(minutes_after(at, i64::MAX), None);
    }

    #[test]
    fn all_day_dates_start_at_midnight() {
        assert_eq!(
            parse_date("2025-03-01"),
            Some(datetime!(2025-03-01 00:00 UTC))
        );
    }
}
