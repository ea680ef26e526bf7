// Central tunables. Values that admins commonly override live in
// `models::AppConfig`; the ones here are engine behavior constants.

/// Refresh an OAuth token this many seconds before its recorded expiry.
pub const PROACTIVE_REFRESH_BUFFER_SECS: i64 = 300;

/// Retry ladder for the token-endpoint refresh call itself.
pub const REFRESH_BACKOFF_SECS: [u64; 3] = [1, 2, 4];

/// Escalating cooldown ladder for rate-limit failures without an
/// authoritative reset, per (credential, model).
pub const TRANSIENT_BACKOFF_STEPS_SECS: [u64; 4] = [10, 30, 60, 120];

/// Credential-wide lockout after an authentication failure.
pub const AUTH_LOCKOUT_SECS: i64 = 300;

/// A cooldown at least this long marks the credential exhausted for the
/// current fair cycle.
pub const EXHAUSTION_COOLDOWN_THRESHOLD_SECS: i64 = 300;

/// A fair cycle older than this clears regardless of the exhausted set.
pub const FAIR_CYCLE_DURATION_SECS: i64 = 3600;

/// Distinct models that must fail on one credential inside
/// `DEAD_KEY_WINDOW_SECS` before the credential is locked out wholesale.
pub const DEAD_KEY_MODEL_THRESHOLD: usize = 3;
pub const DEAD_KEY_WINDOW_SECS: i64 = 60;

/// Resilient writer retry cadence for failed disk writes.
pub const WRITER_RETRY_INTERVAL_SECS: u64 = 30;

/// Usage persistence debounce.
pub const USAGE_SAVE_DEBOUNCE_SECS: i64 = 5;

/// Inter-chunk read budgets.
pub const STREAM_READ_TIMEOUT_SECS: u64 = 180;
pub const NONSTREAM_READ_TIMEOUT_SECS: u64 = 600;

/// Connection-level HTTP budgets for the shared clients.
pub const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const HTTP_POOL_IDLE_PER_HOST: usize = 32;

/// Embedding batcher defaults.
pub const BATCH_SIZE: usize = 64;
pub const BATCH_TIMEOUT_MS: u64 = 100;

/// Model catalog cache TTL.
pub const MODEL_LIST_TTL_SECS: i64 = 300;

/// Dispatch defaults.
pub const DEFAULT_MAX_RETRIES_PER_KEY: u32 = 2;
pub const DEFAULT_GLOBAL_TIMEOUT_SECS: u64 = 120;
pub const RETRY_BACKOFF_MIN_MS: u64 = 250;

/// Default rotation randomization (0.0 = strict least-used).
pub const DEFAULT_ROTATION_TOLERANCE: f64 = 0.25;

/// Shutdown drain grace period.
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

pub const USER_AGENT: &str = concat!("keyloom/", env!("CARGO_PKG_VERSION"));
