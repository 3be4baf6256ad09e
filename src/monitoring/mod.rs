//! Observability hooks: structured events, counters, and a cross-subsystem
//! snapshot composed in one read burst. Deliberately narrow: no CPU/memory/
//! disk sampling, since that belongs to the dashboard layer, not this core.

use crate::consensus::ConsensusCoordinator;
use crate::locks::FileLockManager;
use crate::models::{AgentRecord, ConsensusRequest, FileLock, Priority, TierStatistics};
use crate::queue::QueueEngine;
use crate::registry::AgentRegistry;
use crate::store::Store;
use crate::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// A single structured event emitted by a mutating operation:
/// `{ts, component, op, queue?, priority?, agent?, file?, task_id?, result}`.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub component: String,
    pub op: String,
    pub queue: Option<String>,
    pub priority: Option<String>,
    pub agent: Option<String>,
    pub file: Option<String>,
    pub task_id: Option<String>,
    pub result: String,
}

impl Event {
    pub fn new(component: impl Into<String>, op: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            ts: chrono::Utc::now(),
            component: component.into(),
            op: op.into(),
            queue: None,
            priority: None,
            agent: None,
            file: None,
            task_id: None,
            result: result.into(),
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Publishes events on `task-updates` and increments per-`(component, op)`
/// counters under `metrics:*`.
pub struct Events {
    store: Arc<dyn Store>,
}

impl Events {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn emit(&self, event: Event) -> Result<()> {
        let payload = serde_json::to_string(&event)?;
        self.store.publish("task-updates", &payload).await?;
        self.store
            .hash_incr_by("metrics", &format!("{}:{}", event.component, event.op), 1)
            .await?;
        Ok(())
    }
}

/// One atomic-read-burst composition of `queue_stats + agent_stats +
/// lock_stats + consensus_stats`.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub queue_stats: HashMap<String, HashMap<Priority, TierStatistics>>,
    pub agent_stats: Vec<AgentRecord>,
    pub lock_stats: Vec<FileLock>,
    pub consensus_stats: Vec<ConsensusRequest>,
}

impl Snapshot {
    pub async fn capture(
        queue_engine: &QueueEngine,
        queues: &[String],
        registry: &AgentRegistry,
        locks: &FileLockManager,
        consensus: &ConsensusCoordinator,
        pending_request_ids: &[String],
    ) -> Result<Self> {
        let mut queue_stats = HashMap::new();
        for queue in queues {
            queue_stats.insert(queue.clone(), queue_engine.stats(queue).await?);
        }

        let mut consensus_stats = Vec::new();
        for id in pending_request_ids {
            consensus_stats.push(consensus.get(id).await?);
        }

        Ok(Self {
            queue_stats,
            agent_stats: registry.list_active().await?,
            lock_stats: locks.list_locks().await?,
            consensus_stats,
        })
    }
}
