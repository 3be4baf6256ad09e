//! Agent Registry & Heartbeat: liveness tracking for worker
//! processes bound to one backend family each.

use crate::models::{AgentRecord, AgentStatus, BackendFamily};
use crate::store::Store;
use crate::{CoreError, Result};
use std::sync::Arc;
use tracing::{info, warn};

pub struct AgentRegistry {
    store: Arc<dyn Store>,
}

/// Published to `agent-registry`.
#[derive(serde::Serialize)]
struct RegistryEvent<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    agent: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<AgentStatus>,
    timestamp: chrono::DateTime<chrono::Utc>,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Registers a new agent, or re-registers an existing one (idempotent:
    /// re-registering resets capabilities but preserves nothing else).
    pub async fn register(
        &self,
        agent_id: &str,
        backend: BackendFamily,
        queues: Vec<String>,
        capabilities: Vec<String>,
    ) -> Result<AgentRecord> {
        let record = AgentRecord::new(agent_id, backend, queues, capabilities);
        self.write_record(&record).await?;
        self.store.set_add(&all_agents_key(), agent_id).await?;
        let event = RegistryEvent {
            event_type: "agent_registered",
            agent: agent_id,
            status: None,
            timestamp: chrono::Utc::now(),
        };
        self.store
            .publish("agent-registry", &serde_json::to_string(&event)?)
            .await?;
        info!(agent_id, "agent registered");
        Ok(record)
    }

    /// Updates `last_heartbeat`, `status`, and `current_task_id`, publishing
    /// `agent_status_updated`.
    pub async fn heartbeat(&self, agent_id: &str, status: AgentStatus, current_task: Option<String>) -> Result<()> {
        let mut record = self.get(agent_id).await?;
        record.status = status;
        record.current_task_id = current_task;
        record.last_heartbeat = chrono::Utc::now();
        self.write_record(&record).await?;
        let event = RegistryEvent {
            event_type: "agent_status_updated",
            agent: agent_id,
            status: Some(record.status),
            timestamp: chrono::Utc::now(),
        };
        self.store
            .publish("agent-registry", &serde_json::to_string(&event)?)
            .await?;
        Ok(())
    }

    /// All registered agents that have not reached the terminal `stopped`
    /// state.
    pub async fn list_active(&self) -> Result<Vec<AgentRecord>> {
        let ids = self.store.set_members(&all_agents_key()).await?;
        let mut out = Vec::new();
        for id in ids {
            if let Ok(record) = self.get(&id).await {
                if record.status != AgentStatus::Stopped {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    /// Marks `agent_id` unreachable and returns its last-known record (with
    /// `current_task_id` as it was at the moment of marking) so the caller
    /// can recover its in-flight task and release its locks (crossing into
    /// the queue and lock subsystems is the janitor's job, not the
    /// registry's). The persisted record has `current_task_id` cleared, so
    /// a janitor that re-scans this agent on a later tick — it stays in
    /// `list_active` until explicitly `stop`ped — doesn't see a stale task
    /// id and retry a recovery that already happened.
    pub async fn mark_unreachable(&self, agent_id: &str) -> Result<AgentRecord> {
        let mut record = self.get(agent_id).await?;
        let current_task_id = record.current_task_id.take();
        record.status = AgentStatus::Unreachable;
        self.write_record(&record).await?;
        record.current_task_id = current_task_id;
        let event = RegistryEvent {
            event_type: "agent_unreachable",
            agent: agent_id,
            status: None,
            timestamp: chrono::Utc::now(),
        };
        self.store
            .publish("agent-registry", &serde_json::to_string(&event)?)
            .await?;
        warn!(agent_id, "agent marked unreachable");
        Ok(record)
    }

    /// Explicit shutdown transition (terminal).
    pub async fn stop(&self, agent_id: &str) -> Result<()> {
        let mut record = self.get(agent_id).await?;
        record.status = AgentStatus::Stopped;
        record.current_task_id = None;
        self.write_record(&record).await
    }

    pub async fn get(&self, agent_id: &str) -> Result<AgentRecord> {
        let raw = self
            .store
            .hash_get(&agent_key(agent_id), "record")
            .await?
            .ok_or_else(|| CoreError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn write_record(&self, record: &AgentRecord) -> Result<()> {
        self.store
            .hash_set(&agent_key(&record.id), "record", &serde_json::to_string(record)?)
            .await
    }
}

/// Agents are considered unreachable after `3 × heartbeat_interval` with no
/// update.
pub fn is_unreachable(record: &AgentRecord, unreachable_threshold: chrono::Duration) -> bool {
    chrono::Utc::now() - record.last_heartbeat > unreachable_threshold
}

fn agent_key(agent_id: &str) -> String {
    format!("agent:{agent_id}")
}

fn all_agents_key() -> String {
    "agents:all".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn register_then_heartbeat_updates_status() {
        let registry = AgentRegistry::new(Arc::new(InMemoryStore::new()));
        registry
            .register("agent-1", BackendFamily::new("gpt"), vec!["gpt".to_string()], vec!["testing".to_string()])
            .await
            .unwrap();
        registry
            .heartbeat("agent-1", AgentStatus::Working, Some("task-1".to_string()))
            .await
            .unwrap();

        let record = registry.get("agent-1").await.unwrap();
        assert_eq!(record.status, AgentStatus::Working);
        assert_eq!(record.current_task_id, Some("task-1".to_string()));
    }

    #[tokio::test]
    async fn mark_unreachable_excludes_agent_from_active_list() {
        let registry = AgentRegistry::new(Arc::new(InMemoryStore::new()));
        registry
            .register("agent-1", BackendFamily::new("gpt"), vec!["gpt".to_string()], vec![])
            .await
            .unwrap();
        registry.mark_unreachable("agent-1").await.unwrap();

        let active = registry.list_active().await.unwrap();
        assert!(active.iter().any(|a| a.id == "agent-1" && a.status == AgentStatus::Unreachable));
    }

    #[tokio::test]
    async fn mark_unreachable_clears_current_task_id_in_the_persisted_record() {
        let registry = AgentRegistry::new(Arc::new(InMemoryStore::new()));
        registry
            .register("agent-1", BackendFamily::new("gpt"), vec!["gpt".to_string()], vec![])
            .await
            .unwrap();
        registry
            .heartbeat("agent-1", AgentStatus::Working, Some("task-1".to_string()))
            .await
            .unwrap();

        let returned = registry.mark_unreachable("agent-1").await.unwrap();
        assert_eq!(returned.current_task_id, Some("task-1".to_string()));

        let stored = registry.get("agent-1").await.unwrap();
        assert_eq!(stored.current_task_id, None);
    }

    #[tokio::test]
    async fn stop_removes_agent_from_active_list() {
        let registry = AgentRegistry::new(Arc::new(InMemoryStore::new()));
        registry
            .register("agent-1", BackendFamily::new("gpt"), vec!["gpt".to_string()], vec![])
            .await
            .unwrap();
        registry.stop("agent-1").await.unwrap();

        let active = registry.list_active().await.unwrap();
        assert!(active.is_empty());
    }
}
