//! Consensus & Governance Coordinator: bounded-quorum voting to
//! authorise destructive operations. A pure arbiter — it decides outcomes,
//! it never performs the operation itself.

use crate::models::{ConsensusRequest, ConsensusStatus, Vote};
use crate::store::Store;
use crate::{CoreError, Result};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct ConsensusCoordinator {
    store: Arc<dyn Store>,
}

/// Published to `consensus:new_request`. `operation` and `reason` are
/// caller-supplied free text, so this goes through serde rather than a raw
/// JSON literal.
#[derive(serde::Serialize)]
struct NewRequestEvent<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    request_id: &'a str,
    operation: &'a str,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// Published to `consensus:vote`.
#[derive(serde::Serialize)]
struct VoteEvent<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    request_id: &'a str,
    agent: &'a str,
    approve: bool,
}

/// Published to `consensus:decision`.
#[derive(serde::Serialize)]
struct DecisionEvent<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    request_id: &'a str,
    status: ConsensusStatus,
}

impl ConsensusCoordinator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Creates a pending request and adds it to the expiry-scored pending
    /// set.
    pub async fn request(
        &self,
        operation: &str,
        affected_files: Vec<String>,
        reason: &str,
        required_approvals: u32,
        timeout_secs: i64,
        initiator: &str,
    ) -> Result<String> {
        let now = chrono::Utc::now();
        let request = ConsensusRequest {
            id: Uuid::new_v4().to_string(),
            operation: operation.to_string(),
            affected_files,
            reason: reason.to_string(),
            required_approvals,
            initiator: initiator.to_string(),
            votes: std::collections::HashMap::new(),
            status: ConsensusStatus::Pending,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(timeout_secs),
        };

        self.write_request(&request).await?;
        self.store
            .sorted_set_add(
                &pending_key(),
                &request.id,
                request.expires_at.timestamp() as f64,
            )
            .await?;
        let event = NewRequestEvent {
            event_type: "consensus:new_request",
            request_id: &request.id,
            operation,
            timestamp: now,
        };
        self.store
            .publish("consensus:new_request", &serde_json::to_string(&event)?)
            .await?;
        info!(request_id = %request.id, operation, required_approvals, "consensus request created");
        Ok(request.id)
    }

    /// Records `agent_id`'s vote, rejecting repeat votes or votes against a
    /// non-pending request. Recomputes terminal status after every vote.
    pub async fn vote(&self, request_id: &str, agent_id: &str, approve: bool, comment: Option<String>) -> Result<ConsensusStatus> {
        let mut request = self.get(request_id).await?;

        if request.status != ConsensusStatus::Pending {
            return Err(CoreError::ConsensusNotPending {
                request_id: request_id.to_string(),
            });
        }
        if request.votes.contains_key(agent_id) {
            return Err(CoreError::AlreadyVoted {
                request_id: request_id.to_string(),
                agent_id: agent_id.to_string(),
            });
        }

        request.votes.insert(
            agent_id.to_string(),
            Vote {
                agent_id: agent_id.to_string(),
                approve,
                comment,
                timestamp: chrono::Utc::now(),
            },
        );

        if let Some(decided) = request.decide() {
            request.status = decided;
        }
        self.write_request(&request).await?;

        let vote_event = VoteEvent {
            event_type: "consensus:vote",
            request_id,
            agent: agent_id,
            approve,
        };
        self.store
            .publish("consensus:vote", &serde_json::to_string(&vote_event)?)
            .await?;

        if request.status != ConsensusStatus::Pending {
            self.store.sorted_set_remove(&pending_key(), request_id).await?;
            let decision_event = DecisionEvent {
                event_type: "consensus:decision",
                request_id,
                status: request.status,
            };
            self.store
                .publish("consensus:decision", &serde_json::to_string(&decision_event)?)
                .await?;
            info!(request_id, status = ?request.status, "consensus request reached a terminal decision");
        }

        Ok(request.status)
    }

    /// Cancels a pending request. Fails if the request has already reached
    /// a terminal status.
    pub async fn cancel(&self, request_id: &str, _by: &str) -> Result<()> {
        let mut request = self.get(request_id).await?;
        if request.status != ConsensusStatus::Pending {
            return Err(CoreError::ConsensusNotPending {
                request_id: request_id.to_string(),
            });
        }
        request.status = ConsensusStatus::Canceled;
        self.write_request(&request).await?;
        self.store.sorted_set_remove(&pending_key(), request_id).await?;
        Ok(())
    }

    /// Terminates every pending request whose `expires_at` has passed,
    /// transitioning it to `timeout`.
    pub async fn expire_sweep(&self) -> Result<Vec<String>> {
        let now = chrono::Utc::now().timestamp() as f64;
        let expired = self
            .store
            .sorted_set_range_by_score(&pending_key(), f64::MIN, now)
            .await?;

        let mut expired_ids = Vec::new();
        for entry in expired {
            let mut request = self.get(&entry.member).await?;
            if request.status == ConsensusStatus::Pending {
                request.status = ConsensusStatus::Timeout;
                self.write_request(&request).await?;
                let decision_event = DecisionEvent {
                    event_type: "consensus:decision",
                    request_id: &entry.member,
                    status: ConsensusStatus::Timeout,
                };
                self.store
                    .publish("consensus:decision", &serde_json::to_string(&decision_event)?)
                    .await?;
            }
            self.store.sorted_set_remove(&pending_key(), &entry.member).await?;
            expired_ids.push(entry.member);
        }
        Ok(expired_ids)
    }

    /// Awaits `request_id` reaching a terminal status, returning it once it
    /// does. Listens on `consensus:decision` (published by `vote` and
    /// `expire_sweep`) so the initiator doesn't have to poll, but always
    /// re-reads the request via `get` before returning — both on a matching
    /// event and once `timeout_secs` elapses with nothing terminal observed.
    pub async fn wait_for(&self, request_id: &str, timeout_secs: i64) -> Result<ConsensusStatus> {
        let request = self.get(request_id).await?;
        if request.status != ConsensusStatus::Pending {
            return Ok(request.status);
        }

        let mut events = self.store.subscribe("consensus:decision").await;
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(timeout_secs.max(0) as u64);

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(self.get(request_id).await?.status);
            }
            match tokio::time::timeout(remaining, events.recv()).await {
                Ok(Ok(payload)) if payload.contains(request_id) => {
                    return Ok(self.get(request_id).await?.status);
                }
                Ok(Ok(_)) => continue,
                _ => return Ok(self.get(request_id).await?.status),
            }
        }
    }

    pub async fn get(&self, request_id: &str) -> Result<ConsensusRequest> {
        let raw = self
            .store
            .hash_get(&requests_key(), request_id)
            .await?
            .ok_or_else(|| CoreError::ConsensusNotPending {
                request_id: request_id.to_string(),
            })?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn write_request(&self, request: &ConsensusRequest) -> Result<()> {
        self.store
            .hash_set(&requests_key(), &request.id, &serde_json::to_string(request)?)
            .await
    }
}

fn requests_key() -> String {
    "consensus:requests".to_string()
}

fn pending_key() -> String {
    "consensus:pending".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn two_approvals_reach_quorum() {
        let coordinator = ConsensusCoordinator::new(Arc::new(InMemoryStore::new()));
        let id = coordinator
            .request("mass_delete", vec!["a.js".to_string()], "cleanup", 2, 300, "agent-a")
            .await
            .unwrap();

        let status = coordinator.vote(&id, "v1", true, None).await.unwrap();
        assert_eq!(status, ConsensusStatus::Pending);
        let status = coordinator.vote(&id, "v2", true, None).await.unwrap();
        assert_eq!(status, ConsensusStatus::Approved);
    }

    #[tokio::test]
    async fn terminal_request_rejects_further_votes() {
        let coordinator = ConsensusCoordinator::new(Arc::new(InMemoryStore::new()));
        let id = coordinator
            .request("mass_delete", vec![], "cleanup", 2, 300, "agent-a")
            .await
            .unwrap();
        coordinator.vote(&id, "v1", true, None).await.unwrap();
        coordinator.vote(&id, "v2", true, None).await.unwrap();

        let result = coordinator.vote(&id, "v1", true, None).await;
        assert!(matches!(result, Err(CoreError::ConsensusNotPending { .. })));
    }

    #[tokio::test]
    async fn three_voter_scenario_decides_on_third_vote() {
        let coordinator = ConsensusCoordinator::new(Arc::new(InMemoryStore::new()));
        let id = coordinator
            .request("refactor", vec![], "tidy", 2, 300, "agent-a")
            .await
            .unwrap();

        assert_eq!(coordinator.vote(&id, "v1", true, None).await.unwrap(), ConsensusStatus::Pending);
        assert_eq!(coordinator.vote(&id, "v2", false, None).await.unwrap(), ConsensusStatus::Pending);
        assert_eq!(coordinator.vote(&id, "v3", true, None).await.unwrap(), ConsensusStatus::Approved);

        let err = coordinator.vote(&id, "v1", true, None).await.unwrap_err();
        assert!(matches!(err, CoreError::ConsensusNotPending { .. }));
    }

    #[tokio::test]
    async fn wait_for_returns_immediately_for_an_already_decided_request() {
        let coordinator = ConsensusCoordinator::new(Arc::new(InMemoryStore::new()));
        let id = coordinator
            .request("mass_delete", vec![], "cleanup", 1, 300, "agent-a")
            .await
            .unwrap();
        coordinator.vote(&id, "v1", true, None).await.unwrap();

        let status = coordinator.wait_for(&id, 5).await.unwrap();
        assert_eq!(status, ConsensusStatus::Approved);
    }

    #[tokio::test]
    async fn wait_for_observes_a_vote_cast_while_it_is_waiting() {
        let coordinator = Arc::new(ConsensusCoordinator::new(Arc::new(InMemoryStore::new())));
        let id = coordinator
            .request("mass_delete", vec![], "cleanup", 1, 300, "agent-a")
            .await
            .unwrap();

        let voter = coordinator.clone();
        let vote_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            voter.vote(&vote_id, "v1", true, None).await.unwrap();
        });

        let status = coordinator.wait_for(&id, 5).await.unwrap();
        assert_eq!(status, ConsensusStatus::Approved);
    }

    #[tokio::test]
    async fn wait_for_times_out_on_a_request_nobody_votes_on() {
        let coordinator = ConsensusCoordinator::new(Arc::new(InMemoryStore::new()));
        let id = coordinator
            .request("refactor", vec![], "tidy", 2, 300, "agent-a")
            .await
            .unwrap();

        let status = coordinator.wait_for(&id, 0).await.unwrap();
        assert_eq!(status, ConsensusStatus::Pending);
    }

    #[tokio::test]
    async fn expire_sweep_times_out_stale_requests() {
        let coordinator = ConsensusCoordinator::new(Arc::new(InMemoryStore::new()));
        let id = coordinator
            .request("refactor", vec![], "tidy", 2, -1, "agent-a")
            .await
            .unwrap();
        let expired = coordinator.expire_sweep().await.unwrap();
        assert_eq!(expired, vec![id.clone()]);
        let request = coordinator.get(&id).await.unwrap();
        assert_eq!(request.status, ConsensusStatus::Timeout);
    }
}
