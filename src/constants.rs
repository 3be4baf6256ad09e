//! System-wide default values. Every value here is overridable through the
//! environment variables documented in `config`.

/// Dedup record lifetime.
pub const DEDUP_TTL_SECS: u64 = 300;

/// Queue statistics TTL.
pub const STATS_TTL_SECS: u64 = 24 * 60 * 60;

/// No non-empty tier may wait longer than this before the scheduler forces
/// it to be served.
pub const STARVATION_THRESHOLD_SECS: u64 = 300;

/// Default blocking dequeue window.
pub const DEQUEUE_BLOCK_SECS: u64 = 1;

/// Idle-time scavenger polling interval against `queue:todos`.
pub const SCAVENGER_INTERVAL_SECS: u64 = 10;

/// Default heartbeat cadence.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// An agent is `unreachable` after this many missed heartbeats.
pub const MISSED_HEARTBEATS_THRESHOLD: u32 = 3;

/// Default file lock margin added on top of the task timeout.
pub const LOCK_TTL_MARGIN_SECS: u64 = 60;

/// Default consensus request lifetime, overridable per request.
pub const CONSENSUS_DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Maximum attempts before a task is parked in `queue:<Q>:failed`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Retry budget for transient store errors.
pub const STORE_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Base delay for the store's exponential backoff.
pub const STORE_RETRY_BASE_DELAY_MS: u64 = 50;
