use thiserror::Error;

/// Convenience type alias for `Result`s with `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Main error type for the coordination core.
///
/// Every component — store adapter, queue engine, lock manager, registry,
/// dispatcher, consensus coordinator — surfaces failures through this enum
/// so callers get consistent, structured context regardless of which
/// subsystem raised them.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend invocation error: {0}")]
    Backend(#[from] reqwest::Error),

    #[error("contract violation: {0}")]
    Contract(String),

    #[error("task {task_id} not found")]
    TaskNotFound { task_id: String },

    #[error("lock lost on {path}: {reason}")]
    LockLost { path: String, reason: String },

    #[error("lock held by {owner} ({remaining_ttl_secs}s remaining)")]
    LockHeld {
        owner: String,
        remaining_ttl_secs: i64,
    },

    #[error("agent {agent_id} not found")]
    AgentNotFound { agent_id: String },

    #[error("consensus request {request_id} is not pending")]
    ConsensusNotPending { request_id: String },

    #[error("consensus request {request_id} timed out")]
    ConsensusTimeout { request_id: String },

    #[error("agent {agent_id} already voted on {request_id}")]
    AlreadyVoted {
        request_id: String,
        agent_id: String,
    },

    #[error("queue {queue} is full")]
    QueueFull { queue: String },

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
