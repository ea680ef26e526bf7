use crate::constants::{AUTH_LOCKOUT_SECS, TRANSIENT_BACKOFF_STEPS_SECS};
use crate::dispatch::classify::ErrorKind;
use crate::error::UpstreamError;
use crate::usage::types::{CooldownInfo, CooldownReason, CREDENTIAL_SCOPE};

/// A cooldown decision for one failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct CooldownDecision {
    /// Model name or `CREDENTIAL_SCOPE`.
    pub scope: String,
    pub info: CooldownInfo,
    /// Propagate the reset to the model's whole quota group.
    pub propagate_group: bool,
}

/// Map a classified failure to its cooldown, if any. `prior_backoff` is the
/// ladder position of the previous transient cooldown for this
/// (credential, model) pair.
pub fn decide(
    error: &UpstreamError,
    model: &str,
    prior_backoff: u32,
    now: i64,
) -> Option<CooldownDecision> {
    match error.kind {
        ErrorKind::Authentication => Some(CooldownDecision {
            scope: CREDENTIAL_SCOPE.to_string(),
            info: CooldownInfo {
                reason: CooldownReason::AuthLockout,
                until: now + AUTH_LOCKOUT_SECS,
                started_at: now,
                backoff_count: 0,
            },
            propagate_group: false,
        }),
        ErrorKind::Quota => {
            // Authoritative reset: lock the model (and its group) until then.
            let until = error.reset_at.unwrap_or(now + escalate(prior_backoff));
            Some(CooldownDecision {
                scope: model.to_string(),
                info: CooldownInfo {
                    reason: CooldownReason::QuotaReset,
                    until,
                    started_at: now,
                    backoff_count: 0,
                },
                propagate_group: true,
            })
        }
        ErrorKind::RateLimit => {
            let until = match error.reset_at {
                Some(reset) if reset > now => reset,
                _ => now + escalate(prior_backoff),
            };
            Some(CooldownDecision {
                scope: model.to_string(),
                info: CooldownInfo {
                    reason: CooldownReason::Transient,
                    until,
                    started_at: now,
                    backoff_count: prior_backoff + 1,
                },
                propagate_group: false,
            })
        }
        // Bare 429 without hints: rotate freely, no cooldown recorded.
        ErrorKind::TransientQuota => None,
        ErrorKind::ServerError | ErrorKind::Timeout | ErrorKind::Unknown => {
            Some(CooldownDecision {
                scope: model.to_string(),
                info: CooldownInfo {
                    reason: CooldownReason::Transient,
                    until: now + escalate(prior_backoff),
                    started_at: now,
                    backoff_count: prior_backoff + 1,
                },
                propagate_group: false,
            })
        }
        ErrorKind::ContextLength | ErrorKind::ContentFilter | ErrorKind::NotFound => None,
    }
}

/// The escalating 10/30/60/120 s ladder, saturating at the last step.
fn escalate(prior_backoff: u32) -> i64 {
    let index = (prior_backoff as usize).min(TRANSIENT_BACKOFF_STEPS_SECS.len() - 1);
    TRANSIENT_BACKOFF_STEPS_SECS[index] as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: ErrorKind) -> UpstreamError {
        UpstreamError::new(kind, Some(429), "err")
    }

    #[test]
    fn ladder_escalates_and_saturates() {
        let now = 1000;
        for (prior, expect) in [(0u32, 10), (1, 30), (2, 60), (3, 120), (9, 120)] {
            let decision = decide(&err(ErrorKind::RateLimit), "m", prior, now).unwrap();
            assert_eq!(decision.info.until, now + expect, "prior={}", prior);
            assert_eq!(decision.info.backoff_count, prior + 1);
        }
    }

    #[test]
    fn auth_failure_locks_whole_credential() {
        let decision = decide(&err(ErrorKind::Authentication), "m", 0, 1000).unwrap();
        assert_eq!(decision.scope, CREDENTIAL_SCOPE);
        assert_eq!(decision.info.until, 1000 + AUTH_LOCKOUT_SECS);
        assert!(!decision.propagate_group);
    }

    #[test]
    fn authoritative_quota_reset_propagates_to_group() {
        let error = err(ErrorKind::Quota).with_reset(Some(99_999));
        let decision = decide(&error, "m", 0, 1000).unwrap();
        assert_eq!(decision.scope, "m");
        assert_eq!(decision.info.until, 99_999);
        assert!(decision.propagate_group);
    }

    #[test]
    fn transient_quota_records_nothing() {
        assert!(decide(&err(ErrorKind::TransientQuota), "m", 3, 1000).is_none());
    }

    #[test]
    fn non_retryable_kinds_record_nothing() {
        for kind in [
            ErrorKind::ContextLength,
            ErrorKind::ContentFilter,
            ErrorKind::NotFound,
        ] {
            assert!(decide(&err(kind), "m", 0, 1000).is_none());
        }
    }
}
