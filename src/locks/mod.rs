//! File Lock Manager: leased mutual exclusion over file paths.

use crate::models::FileLock;
use crate::store::Store;
use crate::{CoreError, Result};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of an `acquire` attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    Granted { lease_id: String },
    HeldBy { owner: String, remaining_ttl_secs: i64 },
}

/// Published to `file-locks`. A typed payload rather than hand-built JSON:
/// `file` carries an external task's file path and `reason` an operator's
/// free-text string, either of which could otherwise break a raw literal.
#[derive(serde::Serialize)]
struct LockEvent<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    agent: &'a str,
    file: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    timestamp: chrono::DateTime<chrono::Utc>,
}

pub struct FileLockManager {
    store: Arc<dyn Store>,
}

impl FileLockManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Attempts to acquire `path` for `agent_id`. Grants a fresh lease id on
    /// success; reports the current owner and remaining TTL on contention.
    pub async fn acquire(&self, path: &str, agent_id: &str, ttl_secs: u64) -> Result<AcquireOutcome> {
        let lease_id = Uuid::new_v4().to_string();
        let owner_token = format!("{agent_id}:{lease_id}");

        if self.store.acquire_lease(&lock_key(path), &owner_token, ttl_secs).await? {
            let lock = FileLock {
                path: path.to_string(),
                owner_agent_id: agent_id.to_string(),
                lease_id: lease_id.clone(),
                acquired_at: chrono::Utc::now(),
                ttl_secs,
                forced: false,
                reason: None,
            };
            self.store
                .hash_set(&lock_meta_key(path), "record", &serde_json::to_string(&lock)?)
                .await?;
            self.publish_event("file_claimed", agent_id, path).await?;
            info!(path, agent_id, lease_id, "lock acquired");
            return Ok(AcquireOutcome::Granted { lease_id });
        }

        self.report_held_by(path).await
    }

    /// Renews `path`'s lease for `agent_id`, provided it still owns the
    /// given `lease_id`. Fails with `LockLost` if another owner has since
    /// taken the path (expiry or force takeover).
    pub async fn renew(&self, path: &str, agent_id: &str, lease_id: &str, ttl_secs: u64) -> Result<()> {
        let owner_token = format!("{agent_id}:{lease_id}");
        if self.store.acquire_lease(&lock_key(path), &owner_token, ttl_secs).await? {
            let lock = FileLock {
                path: path.to_string(),
                owner_agent_id: agent_id.to_string(),
                lease_id: lease_id.to_string(),
                acquired_at: chrono::Utc::now(),
                ttl_secs,
                forced: false,
                reason: None,
            };
            self.store
                .hash_set(&lock_meta_key(path), "record", &serde_json::to_string(&lock)?)
                .await?;
            Ok(())
        } else {
            warn!(path, agent_id, lease_id, "renew failed, lock stale");
            Err(CoreError::LockLost {
                path: path.to_string(),
                reason: "stale lease on renew".to_string(),
            })
        }
    }

    /// Releases `path` if `agent_id`/`lease_id` currently own it.
    pub async fn release(&self, path: &str, agent_id: &str, lease_id: &str) -> Result<()> {
        let owner_token = format!("{agent_id}:{lease_id}");
        let released = self.store.release_lease(&lock_key(path), &owner_token).await?;
        if released {
            self.store.hash_delete(&lock_meta_key(path), "record").await?;
            self.publish_event("file_released", agent_id, path).await?;
            info!(path, agent_id, "lock released");
        }
        Ok(())
    }

    /// Unconditionally overwrites `path`'s lock for `agent_id`. The evicted
    /// owner is notified via `file_force_locked` and must abandon its
    /// current write.
    pub async fn force_acquire(&self, path: &str, agent_id: &str, reason: &str, ttl_secs: u64) -> Result<String> {
        let lease_id = Uuid::new_v4().to_string();
        let owner_token = format!("{agent_id}:{lease_id}");
        self.store.force_lease(&lock_key(path), &owner_token, ttl_secs).await?;
        self.store.set_add(&known_paths_key(), path).await?;

        let lock = FileLock {
            path: path.to_string(),
            owner_agent_id: agent_id.to_string(),
            lease_id: lease_id.clone(),
            acquired_at: chrono::Utc::now(),
            ttl_secs,
            forced: true,
            reason: Some(reason.to_string()),
        };
        self.store
            .hash_set(&lock_meta_key(path), "record", &serde_json::to_string(&lock)?)
            .await?;
        let event = LockEvent {
            event_type: "file_force_locked",
            agent: agent_id,
            file: path,
            reason: Some(reason),
            timestamp: chrono::Utc::now(),
        };
        self.store
            .publish("file-locks", &serde_json::to_string(&event)?)
            .await?;
        warn!(path, agent_id, reason, "lock force-acquired");
        Ok(lease_id)
    }

    /// Snapshot of all currently-held locks.
    pub async fn list_locks(&self) -> Result<Vec<FileLock>> {
        let members = self.store.set_members(&known_paths_key()).await?;
        let mut out = Vec::new();
        for path in members {
            if let Some(record) = self.store.hash_get(&lock_meta_key(&path), "record").await? {
                if self.store.exists(&lock_key(&path)).await? {
                    out.push(serde_json::from_str(&record)?);
                    continue;
                }
            }
            self.store.set_remove(&known_paths_key(), &path).await?;
        }
        Ok(out)
    }

    /// Periodic sweep dropping bookkeeping for locks whose TTL has already
    /// elapsed in the store (the store expires the key itself; this just
    /// reconciles the tracked-paths index).
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let members = self.store.set_members(&known_paths_key()).await?;
        let mut cleaned = 0;
        for path in members {
            if !self.store.exists(&lock_key(&path)).await? {
                self.store.hash_delete(&lock_meta_key(&path), "record").await?;
                self.store.set_remove(&known_paths_key(), &path).await?;
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }

    /// Releases every lock currently owned by `agent_id`. Used by the
    /// unreachable-agent janitor.
    pub async fn release_all_for_agent(&self, agent_id: &str) -> Result<u64> {
        let mut released = 0;
        for lock in self.list_locks().await? {
            if lock.owner_agent_id == agent_id {
                self.release(&lock.path, agent_id, &lock.lease_id).await?;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn report_held_by(&self, path: &str) -> Result<AcquireOutcome> {
        let remaining_ttl_secs = self.store.ttl_secs(&lock_key(path)).await?.unwrap_or(0);
        let owner = self
            .store
            .hash_get(&lock_meta_key(path), "record")
            .await?
            .and_then(|raw| serde_json::from_str::<FileLock>(&raw).ok())
            .map(|lock| lock.owner_agent_id)
            .unwrap_or_else(|| "unknown".to_string());
        Ok(AcquireOutcome::HeldBy { owner, remaining_ttl_secs })
    }

    async fn publish_event(&self, event_type: &str, agent_id: &str, path: &str) -> Result<()> {
        self.store.set_add(&known_paths_key(), path).await?;
        let event = LockEvent {
            event_type,
            agent: agent_id,
            file: path,
            reason: None,
            timestamp: chrono::Utc::now(),
        };
        self.store.publish("file-locks", &serde_json::to_string(&event)?).await
    }
}

fn lock_key(path: &str) -> String {
    format!("lock:{path}")
}

fn lock_meta_key(path: &str) -> String {
    format!("lock:{path}:meta")
}

/// Tracks which paths have ever been locked, so `list_locks`/
/// `cleanup_expired` don't need to scan the whole keyspace.
fn known_paths_key() -> String {
    "lock:known_paths".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn acquire_then_contend_then_release_then_reacquire() {
        let manager = FileLockManager::new(Arc::new(InMemoryStore::new()));
        let granted = manager.acquire("src/x.js", "agent-a", 60).await.unwrap();
        assert!(matches!(granted, AcquireOutcome::Granted { .. }));

        let contended = manager.acquire("src/x.js", "agent-b", 60).await.unwrap();
        match contended {
            AcquireOutcome::HeldBy { owner, .. } => assert_eq!(owner, "agent-a"),
            _ => panic!("expected contention"),
        }

        let AcquireOutcome::Granted { lease_id } = granted else {
            unreachable!()
        };
        manager.release("src/x.js", "agent-a", &lease_id).await.unwrap();

        let reacquired = manager.acquire("src/x.js", "agent-b", 60).await.unwrap();
        assert!(matches!(reacquired, AcquireOutcome::Granted { .. }));
    }

    #[tokio::test]
    async fn force_acquire_overwrites_existing_owner() {
        let manager = FileLockManager::new(Arc::new(InMemoryStore::new()));
        manager.acquire("src/x.js", "agent-a", 60).await.unwrap();
        manager
            .force_acquire("src/x.js", "agent-b", "emergency hotfix", 60)
            .await
            .unwrap();

        let locks = manager.list_locks().await.unwrap();
        let lock = locks.iter().find(|l| l.path == "src/x.js").unwrap();
        assert_eq!(lock.owner_agent_id, "agent-b");
        assert!(lock.forced);
    }

    #[tokio::test]
    async fn renew_with_stale_lease_is_rejected() {
        let manager = FileLockManager::new(Arc::new(InMemoryStore::new()));
        manager.acquire("src/x.js", "agent-a", 60).await.unwrap();
        let result = manager.renew("src/x.js", "agent-a", "not-the-real-lease", 60).await;
        assert!(matches!(result, Err(CoreError::LockLost { .. })));
    }

    #[tokio::test]
    async fn force_acquire_event_survives_a_reason_with_embedded_quotes() {
        let store = Arc::new(InMemoryStore::new());
        let manager = FileLockManager::new(store.clone());
        let mut events = store.subscribe("file-locks").await;

        manager
            .force_acquire("src/x.js", "agent-b", r#"operator said "stop now""#, 60)
            .await
            .unwrap();

        let payload = events.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["type"], "file_force_locked");
    }

    #[tokio::test]
    async fn force_acquire_on_a_never_before_seen_path_is_still_listed_and_releasable() {
        let manager = FileLockManager::new(Arc::new(InMemoryStore::new()));
        manager
            .force_acquire("src/new.js", "agent-b", "emergency hotfix", 60)
            .await
            .unwrap();

        let locks = manager.list_locks().await.unwrap();
        assert!(locks.iter().any(|l| l.path == "src/new.js"));

        let released = manager.release_all_for_agent("agent-b").await.unwrap();
        assert_eq!(released, 1);
        assert!(manager.list_locks().await.unwrap().is_empty());
    }
}
