use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Priority ladder for task tiers, in the canonical order defined by the
/// coordination contract. `weight()` returns the configured scheduling
/// weight for each tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Deferred,
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Deferred,
    ];

    /// Configured weight used by the fair scheduler: critical=10, high=5,
    /// normal=1, low=0.5, deferred=0.1.
    pub fn weight(self) -> f64 {
        match self {
            Priority::Critical => 10.0,
            Priority::High => 5.0,
            Priority::Normal => 1.0,
            Priority::Low => 0.5,
            Priority::Deferred => 0.1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Deferred => "deferred",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "deferred" => Ok(Priority::Deferred),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// A backend family identifier (e.g. "claude", "gpt", "deepseek", "mistral",
/// "gemini"). Left as a newtype rather than a fixed enum: the coordination
/// core is agnostic to which concrete backends exist, it only needs a
/// routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendFamily(pub String);

impl BackendFamily {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// A work unit consumed from a priority queue.
///
/// `payload` is intentionally opaque to the core: it carries the file path,
/// prompt text, and task type an external model will act on, but this crate
/// never interprets its contents beyond what's needed for fingerprinting
/// and priority routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub queue: String,
    pub priority: Priority,
    pub payload: TaskPayload,
    pub fingerprint: String,
    pub source: Option<String>,
    pub attempts: u32,
    pub status: TaskStatus,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// The opaque-to-core payload carried by a [`Task`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    pub file: String,
    pub prompt: String,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
}

impl Task {
    /// Builds a new task with a fresh id and a fingerprint computed from the
    /// payload. Does not enqueue it — that's the queue engine's job.
    pub fn new(queue: impl Into<String>, payload: TaskPayload, priority: Priority) -> Self {
        let now = chrono::Utc::now();
        let fingerprint = compute_fingerprint(&payload);
        Self {
            id: Uuid::new_v4().to_string(),
            queue: queue.into(),
            priority,
            payload,
            fingerprint,
            source: None,
            attempts: 0,
            status: TaskStatus::Pending,
            enqueued_at: now,
            updated_at: now,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Canonical fingerprint over `{file, prompt, type}` used for deduplication.
///
/// Normalises whitespace and case, then hashes with two independently
/// seeded 64-bit hashes concatenated into a 128-bit digest. Collisions only
/// ever cause a spurious dedup, never a safety loss.
pub fn compute_fingerprint(payload: &TaskPayload) -> String {
    let file = payload.file.trim().to_ascii_lowercase();
    let prompt = payload
        .prompt
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();
    let task_type = payload
        .task_type
        .as_deref()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    let canonical = format!("file={file}\nprompt={prompt}\ntype={task_type}");
    let hi = hash_with_seed(&canonical, 0x9E37_79B9_7F4A_7C15);
    let lo = hash_with_seed(&canonical, 0xC2B2_AE3D_27D4_EB4F);
    format!("{hi:016x}{lo:016x}")
}

fn hash_with_seed(data: &str, seed: u64) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    seed.hash(&mut hasher);
    data.hash(&mut hasher);
    hasher.finish()
}

/// Outcome of a completed task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub queue: String,
    pub outcome: TaskOutcome,
    pub metadata: HashMap<String, String>,
    pub completed_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskOutcome {
    Success {
        output: String,
        files_created: Vec<String>,
        files_modified: Vec<String>,
    },
    Failure {
        error: String,
        partial_output: Option<String>,
    },
}

/// Liveness status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Registered,
    Idle,
    Working,
    Unreachable,
    Stopped,
}

/// A registered worker process bound to one backend family, serving one or
/// more queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub backend: BackendFamily,
    pub queues: Vec<String>,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub current_task_id: Option<String>,
    pub registered_at: chrono::DateTime<chrono::Utc>,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
}

impl AgentRecord {
    pub fn new(
        id: impl Into<String>,
        backend: BackendFamily,
        queues: Vec<String>,
        capabilities: Vec<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.into(),
            backend,
            queues,
            capabilities,
            status: AgentStatus::Registered,
            current_task_id: None,
            registered_at: now,
            last_heartbeat: now,
        }
    }
}

/// A leased, per-path mutual exclusion lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLock {
    pub path: String,
    pub owner_agent_id: String,
    pub lease_id: String,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
    pub ttl_secs: u64,
    pub forced: bool,
    pub reason: Option<String>,
}

/// Status of a consensus request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub agent_id: String,
    pub approve: bool,
    pub comment: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// A bounded-quorum request to authorise a destructive or policy-level
/// operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRequest {
    pub id: String,
    pub operation: String,
    pub affected_files: Vec<String>,
    pub reason: String,
    pub required_approvals: u32,
    pub initiator: String,
    pub votes: HashMap<String, Vote>,
    pub status: ConsensusStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl ConsensusRequest {
    pub fn approvers(&self) -> usize {
        self.votes.values().filter(|v| v.approve).count()
    }

    pub fn rejectors(&self) -> usize {
        self.votes.values().filter(|v| !v.approve).count()
    }

    /// Recomputes the terminal status from the current vote tally. Returns
    /// `None` while still pending.
    pub fn decide(&self) -> Option<ConsensusStatus> {
        if self.approvers() as u32 >= self.required_approvals {
            return Some(ConsensusStatus::Approved);
        }
        if self.rejectors() as u32 > self.required_approvals / 2 {
            return Some(ConsensusStatus::Rejected);
        }
        None
    }
}

/// Derived, per-(queue, priority) statistics. Ephemeral — TTL governed by
/// the store, not tracked here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierStatistics {
    pub enqueued: u64,
    pub dequeued: u64,
    pub avg_processing_time_secs: f64,
    pub pending: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_normalizes_whitespace_and_case() {
        let a = TaskPayload {
            file: "  A.JS ".to_string(),
            prompt: "Refactor   the  thing".to_string(),
            task_type: Some("Refactor".to_string()),
        };
        let b = TaskPayload {
            file: "a.js".to_string(),
            prompt: "refactor the thing".to_string(),
            task_type: Some("refactor".to_string()),
        };
        assert_eq!(compute_fingerprint(&a), compute_fingerprint(&b));
    }

    #[test]
    fn fingerprint_differs_for_different_payloads() {
        let a = TaskPayload {
            file: "a.js".to_string(),
            prompt: "refactor".to_string(),
            task_type: None,
        };
        let b = TaskPayload {
            file: "b.js".to_string(),
            prompt: "refactor".to_string(),
            task_type: None,
        };
        assert_ne!(compute_fingerprint(&a), compute_fingerprint(&b));
    }

    #[test]
    fn priority_weights_match_ladder() {
        assert_eq!(Priority::Critical.weight(), 10.0);
        assert_eq!(Priority::High.weight(), 5.0);
        assert_eq!(Priority::Normal.weight(), 1.0);
        assert_eq!(Priority::Low.weight(), 0.5);
        assert_eq!(Priority::Deferred.weight(), 0.1);
    }

    fn vote(agent_id: &str, approve: bool) -> Vote {
        Vote {
            agent_id: agent_id.to_string(),
            approve,
            comment: None,
            timestamp: chrono::Utc::now(),
        }
    }

    fn sample_request() -> ConsensusRequest {
        ConsensusRequest {
            id: "r1".into(),
            operation: "mass_delete".into(),
            affected_files: vec![],
            reason: "cleanup".into(),
            required_approvals: 2,
            initiator: "agent-a".into(),
            votes: HashMap::new(),
            status: ConsensusStatus::Pending,
            created_at: chrono::Utc::now(),
            expires_at: chrono::Utc::now() + chrono::Duration::seconds(300),
        }
    }

    #[test]
    fn consensus_decides_approved_at_threshold() {
        let mut req = sample_request();
        req.votes.insert("v1".into(), vote("v1", true));
        assert_eq!(req.decide(), None);
        req.votes.insert("v2".into(), vote("v2", true));
        assert_eq!(req.decide(), Some(ConsensusStatus::Approved));
    }

    #[test]
    fn consensus_decides_rejected_past_half() {
        let mut req = sample_request();
        req.votes.insert("v1".into(), vote("v1", false));
        assert_eq!(req.decide(), None);
        req.votes.insert("v2".into(), vote("v2", false));
        assert_eq!(req.decide(), Some(ConsensusStatus::Rejected));
    }
}
