//! Cross-module scenario tests for the rotation engine.

mod quota_lockout;
