use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::utils::time::{now_secs, parse_rfc3339_secs};

/// What an error response said about when to come back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuotaHint {
    /// Authoritative reset, unix seconds.
    pub reset_at: Option<i64>,
    /// A hint was present even if it did not yield an authoritative reset.
    pub had_hint: bool,
}

/// Parse a quota/rate-limit hint out of an upstream error.
///
/// Sources, in order: the `Retry-After` header, `google.rpc.RetryInfo`
/// (`retryDelay: "3600s"`) and `quotaResetDelay` metadata inside the error
/// details, an OpenAI-style numeric `error.retry_after`, then free-text
/// patterns like "Try again in 2m 30s".
pub fn parse_quota_hint(status: u16, retry_after_header: Option<&str>, body: &str) -> QuotaHint {
    if status != 429 && status != 403 && status != 503 && status != 529 {
        return QuotaHint::default();
    }
    let now = now_secs();

    if let Some(header) = retry_after_header {
        if let Ok(secs) = header.trim().parse::<i64>() {
            return QuotaHint {
                reset_at: Some(now + secs.max(2)),
                had_hint: true,
            };
        }
    }

    let trimmed = body.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
            if let Some(secs) = delay_from_error_details(&json) {
                return QuotaHint {
                    reset_at: Some(now + secs),
                    had_hint: true,
                };
            }
            if let Some(reset) = json
                .get("error")
                .and_then(|e| e.get("reset_time"))
                .and_then(|v| v.as_str())
                .and_then(parse_rfc3339_secs)
            {
                return QuotaHint {
                    reset_at: Some(reset),
                    had_hint: true,
                };
            }
            if let Some(retry) = json
                .get("error")
                .and_then(|e| e.get("retry_after"))
                .and_then(|v| v.as_i64())
            {
                return QuotaHint {
                    reset_at: Some(now + retry.max(2)),
                    had_hint: true,
                };
            }
        }
    }

    if let Some(secs) = delay_from_text(body) {
        return QuotaHint {
            reset_at: Some(now + secs),
            had_hint: true,
        };
    }

    QuotaHint::default()
}

/// Walk `error.details[]` for RetryInfo / quotaResetDelay entries.
fn delay_from_error_details(json: &Value) -> Option<i64> {
    let details = json.get("error")?.get("details")?.as_array()?;
    for detail in details {
        if let Some(type_url) = detail.get("@type").and_then(|v| v.as_str()) {
            if type_url.ends_with("RetryInfo") {
                if let Some(delay) = detail.get("retryDelay").and_then(|v| v.as_str()) {
                    if let Some(secs) = parse_duration_string(delay) {
                        return Some(secs);
                    }
                }
            }
        }
        if let Some(delay) = detail
            .get("metadata")
            .and_then(|m| m.get("quotaResetDelay"))
            .and_then(|v| v.as_str())
        {
            if let Some(secs) = parse_duration_string(delay) {
                return Some(secs);
            }
        }
    }
    None
}

/// Parse duration strings in every combination the providers emit:
/// "2h1m1s", "1h30m", "42s", "510.790006ms".
pub fn parse_duration_string(s: &str) -> Option<i64> {
    static RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+(?:\.\d+)?)s)?(?:(\d+(?:\.\d+)?)ms)?$").unwrap()
    });
    let caps = RE.captures(s.trim())?;

    let hours = caps.get(1).and_then(|m| m.as_str().parse::<i64>().ok()).unwrap_or(0);
    let minutes = caps.get(2).and_then(|m| m.as_str().parse::<i64>().ok()).unwrap_or(0);
    let seconds = caps.get(3).and_then(|m| m.as_str().parse::<f64>().ok()).unwrap_or(0.0);
    let millis = caps.get(4).and_then(|m| m.as_str().parse::<f64>().ok()).unwrap_or(0.0);

    let total = hours * 3600 + minutes * 60 + seconds.ceil() as i64 + (millis / 1000.0).ceil() as i64;
    if total == 0 {
        None
    } else {
        Some(total)
    }
}

/// Free-text fallbacks for providers that only hint in prose.
fn delay_from_text(body: &str) -> Option<i64> {
    static MIN_SEC: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)try again in (\d+)m\s*(\d+)s").unwrap());
    static SECS: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)(?:try again in|backoff for|wait)\s*(\d+)s").unwrap());
    static RESET_IN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)quota will reset in (\d+) second").unwrap());
    static RETRY_AFTER: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)retry after (\d+) second").unwrap());

    if let Some(caps) = MIN_SEC.captures(body) {
        if let (Ok(m), Ok(s)) = (caps[1].parse::<i64>(), caps[2].parse::<i64>()) {
            return Some(m * 60 + s);
        }
    }
    for re in [&*SECS, &*RESET_IN, &*RETRY_AFTER] {
        if let Some(caps) = re.captures(body) {
            if let Ok(s) = caps[1].parse::<i64>() {
                return Some(s);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_info_detail_parses() {
        let body = r#"{"error":{"details":[{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"3600s"}]}}"#;
        let hint = parse_quota_hint(429, None, body);
        assert!(hint.had_hint);
        let reset = hint.reset_at.unwrap();
        let delta = reset - now_secs();
        assert!((3595..=3605).contains(&delta), "delta={}", delta);
    }

    #[test]
    fn quota_reset_delay_metadata_parses() {
        let body = r#"{"error":{"details":[{"metadata":{"quotaResetDelay":"42s"}}]}}"#;
        let hint = parse_quota_hint(429, None, body);
        assert!(hint.had_hint);
        assert!(hint.reset_at.is_some());
    }

    #[test]
    fn retry_after_header_wins() {
        let hint = parse_quota_hint(429, Some("30"), "ignored");
        let delta = hint.reset_at.unwrap() - now_secs();
        assert!((28..=32).contains(&delta));
    }

    #[test]
    fn bare_429_has_no_hint() {
        let hint = parse_quota_hint(429, None, r#"{"error":{"message":"Too Many Requests"}}"#);
        assert!(!hint.had_hint);
        assert!(hint.reset_at.is_none());
    }

    #[test]
    fn duration_strings_cover_all_shapes() {
        assert_eq!(parse_duration_string("2h1m1s"), Some(7261));
        assert_eq!(parse_duration_string("1h30m"), Some(5400));
        assert_eq!(parse_duration_string("42s"), Some(42));
        assert_eq!(parse_duration_string("510.790006ms"), Some(1));
        assert_eq!(parse_duration_string("garbage"), None);
        assert_eq!(parse_duration_string(""), None);
    }

    #[test]
    fn prose_hints_parse() {
        assert!(parse_quota_hint(429, None, "Rate limited. Try again in 2m 30s").had_hint);
        assert!(parse_quota_hint(429, None, "Quota hit. Retry After 99 Seconds").had_hint);
        assert!(parse_quota_hint(429, None, "quota will reset in 120 seconds").had_hint);
    }

    #[test]
    fn non_quota_statuses_are_ignored() {
        assert_eq!(parse_quota_hint(500, Some("30"), ""), QuotaHint::default());
        assert_eq!(parse_quota_hint(400, None, "wait 30s"), QuotaHint::default());
    }
}
