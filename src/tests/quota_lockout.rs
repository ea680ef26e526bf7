use std::collections::HashMap;

use crate::dispatch::classify;
use crate::providers::{google_oauth::GoogleOauthAdapter, ProviderAdapter};
use crate::store::writer::ResilientWriter;
use crate::usage::types::AttemptOutcome;
use crate::usage::{UsageManager, UsageSettings};
use crate::utils::time::now_secs;

const RETRY_INFO_BODY: &str = r#"{"error":{"message":"Quota exceeded","details":[{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"3600s"}]}}"#;

fn grouped_settings() -> UsageSettings {
    let mut settings = UsageSettings {
        max_concurrent: 2,
        ..Default::default()
    };
    for (group, members) in GoogleOauthAdapter::new().quota_groups() {
        for member in &members {
            settings.model_groups.insert(member.clone(), group.clone());
        }
        settings.group_members.insert(group, members);
    }
    settings
}

async fn manager() -> (UsageManager, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let manager = UsageManager::new(
        "gemini_cli",
        grouped_settings(),
        dir.path(),
        ResilientWriter::new(false),
    );
    manager
        .initialize(&[("cred-1".to_string(), 1), ("cred-2".to_string(), 1)])
        .await;
    (manager, dir)
}

/// End-to-end of the quota path: adapter parses the RetryInfo hint, the
/// classifier promotes the 429 to an authoritative Quota error, and the
/// usage manager locks the model out until the parsed reset.
#[tokio::test]
async fn retry_info_429_locks_the_model_for_an_hour() {
    let adapter = GoogleOauthAdapter::new();
    let (manager, _dir) = manager().await;
    let now = now_secs();

    let hint = adapter.parse_quota_error(429, None, RETRY_INFO_BODY);
    let error = classify::classify_http(429, RETRY_INFO_BODY, hint.reset_at, hint.had_hint);
    assert_eq!(error.kind, classify::ErrorKind::Quota);

    manager.begin_attempt("cred-1", "gemini-2.5-pro").await.unwrap();
    manager
        .end_attempt("cred-1", "gemini-2.5-pro", AttemptOutcome::Failure(error))
        .await;

    // Locked for roughly the advertised hour.
    assert!(!manager.is_available("cred-1", "gemini-2.5-pro", now + 10).await);
    assert!(
        !manager
            .is_available("cred-1", "gemini-2.5-pro", now + 3500)
            .await
    );
    assert!(
        manager
            .is_available("cred-1", "gemini-2.5-pro", now + 3700)
            .await
    );
}

#[tokio::test]
async fn lockout_spreads_to_the_quota_group_but_not_beyond() {
    let adapter = GoogleOauthAdapter::new();
    let (manager, _dir) = manager().await;
    let now = now_secs();

    let hint = adapter.parse_quota_error(429, None, RETRY_INFO_BODY);
    let error = classify::classify_http(429, RETRY_INFO_BODY, hint.reset_at, hint.had_hint);

    manager.begin_attempt("cred-1", "gemini-2.5-pro").await.unwrap();
    manager
        .end_attempt("cred-1", "gemini-2.5-pro", AttemptOutcome::Failure(error))
        .await;

    // Grouped sibling locks with it.
    assert!(
        !manager
            .is_available("cred-1", "gemini-2.5-pro-thinking", now + 10)
            .await
    );
    // Ungrouped model on the same credential is unaffected.
    assert!(
        manager
            .is_available("cred-1", "gemini-2.5-flash", now + 10)
            .await
    );
    // Other credentials are untouched entirely.
    assert!(
        manager
            .is_available("cred-2", "gemini-2.5-pro", now + 10)
            .await
    );
}

#[tokio::test]
async fn group_members_share_an_equal_reset_after_propagation() {
    let (manager, _dir) = manager().await;
    let now = now_secs();
    let reset = now + 1800;

    manager
        .apply_quota_reset("cred-1", "gemini-2.5-pro-thinking", reset)
        .await;

    // Both members flip available at the same instant.
    let mut flips = HashMap::new();
    for model in ["gemini-2.5-pro", "gemini-2.5-pro-thinking"] {
        let before = manager.is_available("cred-1", model, reset - 1).await;
        let after = manager.is_available("cred-1", model, reset + 1).await;
        flips.insert(model, (before, after));
    }
    assert_eq!(flips["gemini-2.5-pro"], (false, true));
    assert_eq!(flips["gemini-2.5-pro-thinking"], (false, true));
}
