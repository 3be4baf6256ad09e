//! Priority Queue Engine: per-queue priority tiers with
//! deduplication, weighted fair scheduling, and processing bookkeeping.

mod scheduler;

use crate::constants::{DEDUP_TTL_SECS, STATS_TTL_SECS};
use crate::models::{Priority, Task, TaskPayload, TierStatistics};
use crate::store::Store;
use crate::Result;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Result of an `enqueue` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted { task_id: String },
    Deduplicated { existing_id: String },
}

/// Published to `queue:alerts` when a task exhausts its retry budget.
/// A typed payload rather than hand-built JSON so an arbitrary `reason`
/// string (often a backend error message) can't produce invalid JSON.
#[derive(Debug, Clone, serde::Serialize)]
struct ExhaustionAlert {
    #[serde(rename = "type")]
    alert_type: &'static str,
    queue: String,
    task_id: String,
    reason: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

pub struct QueueEngine {
    store: Arc<dyn Store>,
    dedup_ttl_secs: u64,
    starvation_threshold_secs: i64,
    max_attempts: u32,
}

impl QueueEngine {
    pub fn new(store: Arc<dyn Store>, dedup_ttl_secs: u64, starvation_threshold_secs: i64, max_attempts: u32) -> Self {
        Self {
            store,
            dedup_ttl_secs,
            starvation_threshold_secs,
            max_attempts,
        }
    }

    pub fn with_defaults(store: Arc<dyn Store>) -> Self {
        Self::new(
            store,
            DEDUP_TTL_SECS,
            crate::constants::STARVATION_THRESHOLD_SECS as i64,
            crate::constants::DEFAULT_MAX_ATTEMPTS,
        )
    }

    /// Enqueues `payload` into `queue` at `priority`, deduplicating against
    /// any unexpired in-flight task with the same fingerprint.
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: TaskPayload,
        priority: Priority,
    ) -> Result<EnqueueOutcome> {
        let task = Task::new(queue, payload, priority);
        let dedup_key = dedup_key(queue, &task.fingerprint);

        if let Some(existing_id) = self.store.string_get(&dedup_key).await? {
            debug!(queue, fingerprint = %task.fingerprint, existing_id, "enqueue deduplicated");
            return Ok(EnqueueOutcome::Deduplicated { existing_id });
        }

        let serialized = serde_json::to_string(&task)?;
        self.store
            .list_push_front(&tier_key(queue, priority), &serialized)
            .await?;
        self.store.set_add(&priorities_key(queue), priority.as_str()).await?;
        self.store
            .sorted_set_add(&priority_weights_key(queue), priority.as_str(), priority.weight())
            .await?;
        self.incr_stat(queue, "enqueued", priority, 1).await?;

        // First writer wins; a racing duplicate's lookup above simply
        // retries against whichever id landed first.
        if !self
            .store
            .string_set_nx_ttl(&dedup_key, &task.id, self.dedup_ttl_secs)
            .await?
        {
            if let Some(existing_id) = self.store.string_get(&dedup_key).await? {
                return Ok(EnqueueOutcome::Deduplicated { existing_id });
            }
        }

        info!(queue, task_id = %task.id, priority = priority.as_str(), "task enqueued");
        Ok(EnqueueOutcome::Accepted { task_id: task.id })
    }

    /// Enqueues `payload` at the priority resolved by `rules`, falling back
    /// to `Priority::Normal` when nothing matches. The producer-facing
    /// counterpart of `enqueue` for callers holding a loaded
    /// `PriorityRules`, which is reloadable on SIGHUP.
    pub async fn enqueue_auto(
        &self,
        queue: &str,
        payload: TaskPayload,
        rules: &crate::config::PriorityRules,
    ) -> Result<EnqueueOutcome> {
        let priority = rules.resolve(&payload).unwrap_or(Priority::Normal);
        self.enqueue(queue, payload, priority).await
    }

    /// Dequeues the next task across `queues`, honoring the weighted fair
    /// scheduler, blocking up to `timeout_secs` if none is immediately
    /// available.
    pub async fn dequeue(
        &self,
        queues: &[String],
        timeout_secs: u64,
    ) -> Result<Option<(String, Task)>> {
        let deadline = SystemTime::now() + Duration::from_secs(timeout_secs.max(1));
        loop {
            for queue in queues {
                if let Some(task) = self.try_dequeue_one(queue).await? {
                    return Ok(Some((queue.clone(), task)));
                }
            }
            if SystemTime::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn try_dequeue_one(&self, queue: &str) -> Result<Option<Task>> {
        let candidate_priorities = self.store.set_members(&priorities_key(queue)).await?;
        let mut non_empty = Vec::new();
        for raw in &candidate_priorities {
            let Ok(priority) = raw.parse::<Priority>() else {
                continue;
            };
            let len = self.store.list_length(&tier_key(queue, priority)).await?;
            if len > 0 {
                non_empty.push(priority);
            } else {
                // Opportunistic cleanup: the active-priorities set is a
                // hint, not authoritative.
                self.store
                    .set_remove(&priorities_key(queue), raw)
                    .await?;
            }
        }

        let Some(priority) = scheduler::select_priority(
            self.store.as_ref(),
            queue,
            &non_empty,
            self.starvation_threshold_secs,
            now_epoch_secs(),
        )
        .await?
        else {
            return Ok(None);
        };

        let Some(raw) = self.store.list_pop_back(&tier_key(queue, priority)).await? else {
            return Ok(None);
        };
        let mut task: Task = serde_json::from_str(&raw)?;
        task.status = crate::models::TaskStatus::InProgress;

        let serialized = serde_json::to_string(&task)?;
        self.store
            .list_push_front(&processing_key(queue), &serialized)
            .await?;
        self.store
            .hash_set(
                &processing_started_key(queue),
                &task.id,
                &now_epoch_secs().to_string(),
            )
            .await?;
        self.incr_stat(queue, "dequeued", priority, 1).await?;

        debug!(queue, task_id = %task.id, priority = priority.as_str(), "task dequeued");
        Ok(Some(task))
    }

    /// Marks `task` as finished: removes it from the processing list and
    /// updates the running-mean processing time for its priority tier.
    pub async fn complete_processing(&self, queue: &str, task: &Task) -> Result<()> {
        let serialized = serde_json::to_string(task)?;
        self.store
            .list_remove(&processing_key(queue), 1, &serialized)
            .await?;

        let started_at = self
            .store
            .hash_get(&processing_started_key(queue), &task.id)
            .await?
            .and_then(|v| v.parse::<i64>().ok());
        self.store
            .hash_delete(&processing_started_key(queue), &task.id)
            .await?;

        if let Some(started_at) = started_at {
            let elapsed_secs = (now_epoch_secs() - started_at).max(0) as f64;
            self.record_processing_time(queue, task.priority, elapsed_secs)
                .await?;
        }

        info!(queue, task_id = %task.id, "processing completed");
        Ok(())
    }

    /// Re-inserts `task` at the head of its original tier, incrementing its
    /// attempt counter. Publishes an exhaustion alert once `attempts`
    /// reaches `max_attempts`.
    pub async fn requeue(&self, queue: &str, mut task: Task, reason: &str) -> Result<Task> {
        let serialized_before = serde_json::to_string(&task)?;
        self.store
            .list_remove(&processing_key(queue), 1, &serialized_before)
            .await?;
        self.store
            .hash_delete(&processing_started_key(queue), &task.id)
            .await?;

        task.attempts += 1;
        task.status = crate::models::TaskStatus::Pending;
        task.updated_at = chrono::Utc::now();

        if task.attempts >= self.max_attempts {
            let serialized = serde_json::to_string(&task)?;
            self.store
                .list_push_front(&failed_key(queue), &serialized)
                .await?;
            let alert = ExhaustionAlert {
                alert_type: "task_exhausted",
                queue: queue.to_string(),
                task_id: task.id.clone(),
                reason: reason.to_string(),
                timestamp: chrono::Utc::now(),
            };
            self.store
                .publish("queue:alerts", &serde_json::to_string(&alert)?)
                .await?;
            warn!(queue, task_id = %task.id, attempts = task.attempts, "task exhausted, moved to failed");
            return Ok(task);
        }

        let serialized = serde_json::to_string(&task)?;
        self.store
            .list_push_front(&tier_key(queue, task.priority), &serialized)
            .await?;
        self.store
            .set_add(&priorities_key(queue), task.priority.as_str())
            .await?;
        info!(queue, task_id = %task.id, attempts = task.attempts, reason, "task requeued");
        Ok(task)
    }

    /// Returns `task` to the head of its tier unchanged (no attempt
    /// increment): used for graceful shutdown, where in-flight work is
    /// handed back rather than treated as a failure.
    pub async fn return_to_head(&self, queue: &str, task: &Task) -> Result<()> {
        let serialized = serde_json::to_string(task)?;
        self.store
            .list_remove(&processing_key(queue), 1, &serialized)
            .await?;
        self.store
            .hash_delete(&processing_started_key(queue), &task.id)
            .await?;
        self.store
            .list_push_front(&tier_key(queue, task.priority), &serialized)
            .await?;
        self.store
            .set_add(&priorities_key(queue), task.priority.as_str())
            .await?;
        info!(queue, task_id = %task.id, "task returned to head on shutdown");
        Ok(())
    }

    /// Finds `task_id` in `queue`'s processing list and requeues it at the
    /// head of its tier. Used by the unreachable-agent janitor to recover
    /// work orphaned by a dead worker.
    pub async fn recover_orphaned(&self, queue: &str, task_id: &str) -> Result<Option<Task>> {
        let entries = self.store.list_range(&processing_key(queue), 0, -1).await?;
        for raw in entries {
            let Ok(task) = serde_json::from_str::<Task>(&raw) else {
                continue;
            };
            if task.id == task_id {
                let requeued = self.requeue(queue, task, "agent unreachable").await?;
                return Ok(Some(requeued));
            }
        }
        Ok(None)
    }

    /// Snapshot of pending/enqueued/dequeued/avg-time per tier.
    pub async fn stats(&self, queue: &str) -> Result<std::collections::HashMap<Priority, TierStatistics>> {
        let mut out = std::collections::HashMap::new();
        for priority in Priority::ALL {
            let pending = self.store.list_length(&tier_key(queue, priority)).await?;
            let enqueued = self.read_stat(queue, "enqueued", priority).await?;
            let dequeued = self.read_stat(queue, "dequeued", priority).await?;
            let avg_raw = self
                .store
                .string_get(&stat_key(queue, "avg_time", priority))
                .await?
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0);
            out.insert(
                priority,
                TierStatistics {
                    enqueued: enqueued as u64,
                    dequeued: dequeued as u64,
                    avg_processing_time_secs: avg_raw,
                    pending,
                },
            );
        }
        Ok(out)
    }

    async fn incr_stat(&self, queue: &str, field: &str, priority: Priority, delta: i64) -> Result<()> {
        let current = self.read_stat(queue, field, priority).await?;
        self.store
            .string_set_ttl(
                &stat_key(queue, field, priority),
                &(current + delta).to_string(),
                STATS_TTL_SECS,
            )
            .await
    }

    async fn read_stat(&self, queue: &str, field: &str, priority: Priority) -> Result<i64> {
        Ok(self
            .store
            .string_get(&stat_key(queue, field, priority))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn record_processing_time(&self, queue: &str, priority: Priority, elapsed_secs: f64) -> Result<()> {
        let count_key = stat_key(queue, "count", priority);
        let avg_key = stat_key(queue, "avg_time", priority);

        let count: i64 = self
            .store
            .string_get(&count_key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let avg: f64 = self
            .store
            .string_get(&avg_key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);

        let new_avg = avg + (elapsed_secs - avg) / (count as f64 + 1.0);
        self.store
            .string_set_ttl(&avg_key, &new_avg.to_string(), STATS_TTL_SECS)
            .await?;
        self.store
            .string_set_ttl(&count_key, &(count + 1).to_string(), STATS_TTL_SECS)
            .await?;
        Ok(())
    }
}

fn tier_key(queue: &str, priority: Priority) -> String {
    format!("queue:{queue}:p:{}", priority.as_str())
}

fn priorities_key(queue: &str) -> String {
    format!("queue:{queue}:priorities")
}

fn priority_weights_key(queue: &str) -> String {
    format!("queue:{queue}:priority_weights")
}

fn stat_key(queue: &str, field: &str, priority: Priority) -> String {
    format!("queue:{queue}:stats:{field}:{}", priority.as_str())
}

fn processing_key(queue: &str) -> String {
    format!("processing:{queue}")
}

fn processing_started_key(queue: &str) -> String {
    format!("processing:{queue}:started_at")
}

fn failed_key(queue: &str) -> String {
    format!("queue:{queue}:failed")
}

fn dedup_key(queue: &str, fingerprint: &str) -> String {
    format!("dedup:{queue}:{fingerprint}")
}

fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn payload(file: &str, prompt: &str) -> TaskPayload {
        TaskPayload {
            file: file.to_string(),
            prompt: prompt.to_string(),
            task_type: Some("refactor".to_string()),
        }
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_round_trip() {
        let engine = QueueEngine::with_defaults(Arc::new(InMemoryStore::new()));
        let outcome = engine
            .enqueue("gpt", payload("a.js", "refactor it"), Priority::Normal)
            .await
            .unwrap();
        let EnqueueOutcome::Accepted { task_id } = outcome else {
            panic!("expected accepted");
        };
        let (queue, task) = engine
            .dequeue(&["gpt".to_string()], 1)
            .await
            .unwrap()
            .expect("task available");
        assert_eq!(queue, "gpt");
        assert_eq!(task.id, task_id);
    }

    #[tokio::test]
    async fn duplicate_enqueue_within_ttl_is_deduplicated() {
        let engine = QueueEngine::with_defaults(Arc::new(InMemoryStore::new()));
        let first = engine
            .enqueue("gpt", payload("a.js", "refactor"), Priority::Normal)
            .await
            .unwrap();
        let EnqueueOutcome::Accepted { task_id } = first else {
            panic!("expected accepted");
        };
        let second = engine
            .enqueue("gpt", payload("a.js", "refactor"), Priority::Normal)
            .await
            .unwrap();
        assert_eq!(second, EnqueueOutcome::Deduplicated { existing_id: task_id });

        let pending = engine.store.list_length(&tier_key("gpt", Priority::Normal)).await.unwrap();
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn critical_preempts_normal_tasks() {
        let engine = QueueEngine::with_defaults(Arc::new(InMemoryStore::new()));
        for i in 0..3 {
            engine
                .enqueue("gpt", payload(&format!("n{i}.js"), "do work"), Priority::Normal)
                .await
                .unwrap();
        }
        engine
            .enqueue("gpt", payload("hot.js", "urgent fix"), Priority::Critical)
            .await
            .unwrap();

        let mut order = Vec::new();
        for _ in 0..4 {
            let (_, task) = engine.dequeue(&["gpt".to_string()], 1).await.unwrap().unwrap();
            order.push(task.priority);
        }
        assert_eq!(
            order,
            vec![Priority::Critical, Priority::Normal, Priority::Normal, Priority::Normal]
        );
    }

    #[tokio::test]
    async fn requeue_increments_attempts_and_reappears_at_head() {
        let engine = QueueEngine::with_defaults(Arc::new(InMemoryStore::new()));
        engine
            .enqueue("gpt", payload("a.js", "do work"), Priority::Normal)
            .await
            .unwrap();
        let (queue, task) = engine.dequeue(&["gpt".to_string()], 1).await.unwrap().unwrap();
        let requeued = engine.requeue(&queue, task, "worker died").await.unwrap();
        assert_eq!(requeued.attempts, 1);

        let (_, redequeued) = engine.dequeue(&["gpt".to_string()], 1).await.unwrap().unwrap();
        assert_eq!(redequeued.id, requeued.id);
    }

    #[tokio::test]
    async fn enqueue_auto_resolves_priority_from_rules() {
        use crate::config::{PriorityRule, PriorityRules};

        let engine = QueueEngine::with_defaults(Arc::new(InMemoryStore::new()));
        let rules = PriorityRules {
            rules: vec![PriorityRule {
                task_type: Some("hotfix".to_string()),
                file_prefix: None,
                keyword: None,
                priority: Priority::Critical,
            }],
        };

        let outcome = engine
            .enqueue_auto(
                "gpt",
                TaskPayload {
                    file: "a.js".to_string(),
                    prompt: "fix it".to_string(),
                    task_type: Some("hotfix".to_string()),
                },
                &rules,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Accepted { .. }));

        let pending = engine.store.list_length(&tier_key("gpt", Priority::Critical)).await.unwrap();
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn exhaustion_alert_survives_a_reason_with_embedded_quotes() {
        let store = Arc::new(InMemoryStore::new());
        let engine = QueueEngine::new(store.clone(), 300, 300, 1);
        let mut alerts = store.subscribe("queue:alerts").await;

        engine
            .enqueue("gpt", payload("a.js", "do work"), Priority::Normal)
            .await
            .unwrap();
        let (queue, task) = engine.dequeue(&["gpt".to_string()], 1).await.unwrap().unwrap();
        engine
            .requeue(&queue, task, r#"backend said "invalid escape \n""#)
            .await
            .unwrap();

        let payload = alerts.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed["type"], "task_exhausted");
    }

    #[tokio::test]
    async fn exhausted_task_lands_in_failed_list() {
        let engine = QueueEngine::new(Arc::new(InMemoryStore::new()), 300, 300, 1);
        engine
            .enqueue("gpt", payload("a.js", "do work"), Priority::Normal)
            .await
            .unwrap();
        let (queue, task) = engine.dequeue(&["gpt".to_string()], 1).await.unwrap().unwrap();
        engine.requeue(&queue, task, "failed once").await.unwrap();

        let failed_len = engine.store.list_length(&failed_key("gpt")).await.unwrap();
        assert_eq!(failed_len, 1);
        let pending = engine.store.list_length(&tier_key("gpt", Priority::Normal)).await.unwrap();
        assert_eq!(pending, 0);
    }
}
