/// Current unix time in whole seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current unix time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Parse an RFC 3339 timestamp ("2026-01-08T17:00:00Z") to unix seconds.
pub fn parse_rfc3339_secs(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp())
}

/// Next occurrence of the given UTC hour, strictly after `now`.
pub fn next_utc_hour(now: i64, hour: u32) -> i64 {
    use chrono::{Duration, TimeZone, Timelike, Utc};
    let now_dt = Utc.timestamp_opt(now, 0).single().unwrap_or_else(Utc::now);
    let today_at = now_dt
        .with_hour(hour)
        .and_then(|d| d.with_minute(0))
        .and_then(|d| d.with_second(0))
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(now_dt);
    if today_at.timestamp() > now {
        today_at.timestamp()
    } else {
        (today_at + Duration::days(1)).timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_parses_utc() {
        assert_eq!(
            parse_rfc3339_secs("1970-01-01T01:00:00Z"),
            Some(3600),
        );
        assert!(parse_rfc3339_secs("not-a-date").is_none());
    }

    #[test]
    fn next_utc_hour_rolls_to_tomorrow() {
        // 1970-01-02 03:00:00 UTC
        let now = 86400 + 3 * 3600;
        // Asking for hour 3 exactly at 03:00 must move to the next day.
        assert_eq!(next_utc_hour(now, 3), now + 86400);
        // Hour 4 is later today.
        assert_eq!(next_utc_hour(now, 4), now + 3600);
    }
}
