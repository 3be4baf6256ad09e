//! Dispatcher / Worker Loop: per-agent pipeline of a heartbeat
//! sub-task, a lock-renewal sub-task, the primary dequeue stage, and an
//! idle-time scavenger — each an explicit `tokio::spawn`ed component wired
//! by channels instead of a shared-state observer pattern.

mod scavenger;

use crate::backend::BackendClient;
use crate::config::Config;
use crate::consensus::ConsensusCoordinator;
use crate::locks::{AcquireOutcome, FileLockManager};
use crate::models::{AgentStatus, BackendFamily, Task, TaskOutcome, TaskResult};
use crate::monitoring::{Event, Events};
use crate::queue::QueueEngine;
use crate::registry::{self, AgentRegistry};
use crate::store::Store;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

pub use scavenger::run_scavenger;

/// A lock acquired or released by the primary dequeue stage, reported to
/// the lock-renewal sub-task over a channel rather than shared state.
#[derive(Debug, Clone)]
enum LockEvent {
    Acquired { path: String, lease_id: String, ttl_secs: u64 },
    Released { path: String },
}

/// Published to `coordination-required`. `file` carries an external task's
/// path, so this goes through serde rather than a raw JSON literal.
#[derive(serde::Serialize)]
struct CoordinationRequiredEvent<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    file: &'a str,
    held_by: &'a str,
    remaining_ttl_secs: i64,
}

pub struct Dispatcher {
    agent_id: String,
    backend: BackendFamily,
    queues: Vec<String>,
    store: Arc<dyn Store>,
    queue_engine: Arc<QueueEngine>,
    locks: Arc<FileLockManager>,
    registry: Arc<AgentRegistry>,
    consensus: Arc<ConsensusCoordinator>,
    backend_client: Arc<dyn BackendClient>,
    events: Events,
    config: Config,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: impl Into<String>,
        backend: BackendFamily,
        queues: Vec<String>,
        store: Arc<dyn Store>,
        queue_engine: Arc<QueueEngine>,
        locks: Arc<FileLockManager>,
        registry: Arc<AgentRegistry>,
        consensus: Arc<ConsensusCoordinator>,
        backend_client: Arc<dyn BackendClient>,
        config: Config,
    ) -> Self {
        let events = Events::new(store.clone());
        Self {
            agent_id: agent_id.into(),
            backend,
            queues,
            store,
            queue_engine,
            locks,
            registry,
            consensus,
            backend_client,
            events,
            config,
        }
    }

    /// Registers the agent and runs the pipeline until `shutdown` fires.
    /// On shutdown: flushes a `stopped` heartbeat, releases all held locks,
    /// and returns any in-flight task to the head of its tier.
    pub async fn run(self: Arc<Self>, capabilities: Vec<String>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.registry
            .register(&self.agent_id, self.backend.clone(), self.queues.clone(), capabilities)
            .await?;

        let (lock_tx, lock_rx) = mpsc::unbounded_channel::<LockEvent>();
        let (status_tx, status_rx) = watch::channel(AgentStatus::Idle);
        let (task_tx, task_rx) = watch::channel(None::<String>);

        let heartbeat_handle = tokio::spawn(run_heartbeat(
            self.registry.clone(),
            self.agent_id.clone(),
            self.config.heartbeat_interval,
            status_rx,
            task_rx,
            shutdown.clone(),
        ));

        let lock_renewal_handle = tokio::spawn(run_lock_renewal(
            self.locks.clone(),
            self.agent_id.clone(),
            lock_rx,
            shutdown.clone(),
        ));

        let scavenger_handle = tokio::spawn(run_scavenger(self.store.clone(), shutdown.clone()));

        let janitor_handle = tokio::spawn(run_janitor(
            self.registry.clone(),
            self.queue_engine.clone(),
            self.locks.clone(),
            self.config.heartbeat_interval,
            self.config.unreachable_threshold(),
            shutdown.clone(),
        ));

        let consensus_sweep_handle = tokio::spawn(run_consensus_sweep(
            self.consensus.clone(),
            self.config.heartbeat_interval,
            shutdown.clone(),
        ));

        let dispatcher = self.clone();
        let dequeue_handle = tokio::spawn(async move {
            dispatcher
                .run_dequeue_stage(lock_tx, status_tx, task_tx, shutdown.clone())
                .await
        });

        let _ = shutdown.changed().await;

        let _ = tokio::join!(
            heartbeat_handle,
            lock_renewal_handle,
            scavenger_handle,
            janitor_handle,
            consensus_sweep_handle,
            dequeue_handle
        );

        self.registry.stop(&self.agent_id).await?;
        info!(agent_id = %self.agent_id, "dispatcher shut down");
        Ok(())
    }

    async fn run_dequeue_stage(
        self: Arc<Self>,
        lock_tx: mpsc::UnboundedSender<LockEvent>,
        status_tx: watch::Sender<AgentStatus>,
        task_tx: watch::Sender<Option<String>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let dequeued = tokio::select! {
                result = self.queue_engine.dequeue(&self.queues, crate::constants::DEQUEUE_BLOCK_SECS) => result?,
                _ = shutdown.changed() => return Ok(()),
            };

            let Some((queue, task)) = dequeued else {
                continue;
            };

            let _ = status_tx.send(AgentStatus::Working);
            let _ = task_tx.send(Some(task.id.clone()));

            if let Err(e) = self
                .process_task(&queue, task, &lock_tx, &mut shutdown)
                .await
            {
                error!(queue, error = %e, "task processing failed");
            }

            let _ = status_tx.send(AgentStatus::Idle);
            let _ = task_tx.send(None);
        }
    }

    async fn process_task(
        &self,
        queue: &str,
        task: Task,
        lock_tx: &mpsc::UnboundedSender<LockEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let path = task.payload.file.clone();
        let ttl_secs = self.config.lock_ttl().as_secs();

        let lease_id = match self.locks.acquire(&path, &self.agent_id, ttl_secs).await? {
            AcquireOutcome::Granted { lease_id } => lease_id,
            AcquireOutcome::HeldBy { owner, remaining_ttl_secs } => {
                let event = CoordinationRequiredEvent {
                    event_type: "coordination-required",
                    file: &path,
                    held_by: &owner,
                    remaining_ttl_secs,
                };
                self.store
                    .publish("coordination-required", &serde_json::to_string(&event)?)
                    .await?;
                self.queue_engine
                    .requeue(queue, task, "file lock contention")
                    .await?;
                return Ok(());
            }
        };
        let _ = lock_tx.send(LockEvent::Acquired {
            path: path.clone(),
            lease_id: lease_id.clone(),
            ttl_secs,
        });

        let invocation = tokio::select! {
            result = self.backend_client.invoke(self.backend.as_str(), &task.payload.prompt) => result,
            _ = shutdown.changed() => {
                self.locks.release(&path, &self.agent_id, &lease_id).await?;
                let _ = lock_tx.send(LockEvent::Released { path });
                self.queue_engine.return_to_head(queue, &task).await?;
                return Ok(());
            }
        };

        self.locks.release(&path, &self.agent_id, &lease_id).await?;
        let _ = lock_tx.send(LockEvent::Released { path: path.clone() });

        match invocation {
            Ok(output) => {
                self.queue_engine.complete_processing(queue, &task).await?;
                let result = TaskResult {
                    task_id: task.id.clone(),
                    queue: queue.to_string(),
                    outcome: TaskOutcome::Success {
                        output,
                        files_created: Vec::new(),
                        files_modified: vec![path],
                    },
                    metadata: HashMap::new(),
                    completed_at: chrono::Utc::now(),
                };
                self.store
                    .publish("task-updates", &serde_json::to_string(&result)?)
                    .await?;
                self.events
                    .emit(
                        Event::new("dispatcher", "task_completed", "success")
                            .with_queue(queue)
                            .with_agent(self.agent_id.as_str())
                            .with_task_id(task.id.as_str()),
                    )
                    .await?;
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "backend invocation failed");
                self.queue_engine.requeue(queue, task.clone(), &e.to_string()).await?;
                self.events
                    .emit(
                        Event::new("dispatcher", "task_failed", "error")
                            .with_queue(queue)
                            .with_agent(self.agent_id.as_str())
                            .with_task_id(task.id.as_str()),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

async fn run_heartbeat(
    registry: Arc<AgentRegistry>,
    agent_id: String,
    interval: std::time::Duration,
    status_rx: watch::Receiver<AgentStatus>,
    task_rx: watch::Receiver<Option<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status = *status_rx.borrow();
                let current_task = task_rx.borrow().clone();
                if let Err(e) = registry.heartbeat(&agent_id, status, current_task).await {
                    error!(agent_id, error = %e, "heartbeat failed");
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

async fn run_lock_renewal(
    locks: Arc<FileLockManager>,
    agent_id: String,
    mut events: mpsc::UnboundedReceiver<LockEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let held: Mutex<HashMap<String, (String, u64)>> = Mutex::new(HashMap::new());
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
        crate::constants::LOCK_TTL_MARGIN_SECS / 2,
    ));
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                let mut held = held.lock().await;
                match event {
                    LockEvent::Acquired { path, lease_id, ttl_secs } => {
                        held.insert(path, (lease_id, ttl_secs));
                    }
                    LockEvent::Released { path } => {
                        held.remove(&path);
                    }
                }
            }
            _ = ticker.tick() => {
                let held = held.lock().await;
                for (path, (lease_id, ttl_secs)) in held.iter() {
                    if let Err(e) = locks.renew(path, &agent_id, lease_id, *ttl_secs).await {
                        warn!(path, error = %e, "lock renewal failed");
                    }
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Polls the registry every `heartbeat_interval` for agents that have missed
/// `unreachable_threshold` worth of heartbeats, marks them unreachable, and
/// recovers their in-flight work: requeues the orphaned task and releases
/// every lock they held.
async fn run_janitor(
    registry: Arc<AgentRegistry>,
    queue_engine: Arc<QueueEngine>,
    locks: Arc<FileLockManager>,
    interval: std::time::Duration,
    unreachable_threshold: chrono::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let active = match registry.list_active().await {
                    Ok(agents) => agents,
                    Err(e) => {
                        warn!(error = %e, "janitor failed to list active agents");
                        continue;
                    }
                };
                for agent in active {
                    if !registry::is_unreachable(&agent, unreachable_threshold) {
                        continue;
                    }
                    let stale = match registry.mark_unreachable(&agent.id).await {
                        Ok(record) => record,
                        Err(e) => {
                            warn!(agent_id = %agent.id, error = %e, "janitor failed to mark agent unreachable");
                            continue;
                        }
                    };
                    if let Some(task_id) = &stale.current_task_id {
                        let mut recovered = false;
                        for queue in &stale.queues {
                            match queue_engine.recover_orphaned(queue, task_id).await {
                                Ok(Some(_)) => {
                                    recovered = true;
                                    break;
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    warn!(agent_id = %stale.id, queue, task_id, error = %e, "janitor failed to recover orphaned task");
                                }
                            }
                        }
                        if !recovered {
                            warn!(agent_id = %stale.id, task_id, queues = ?stale.queues, "janitor found no queue holding the orphaned task");
                        }
                    }
                    if let Err(e) = locks.release_all_for_agent(&stale.id).await {
                        warn!(agent_id = %stale.id, error = %e, "janitor failed to release locks");
                    }
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Sweeps expired consensus requests on the same cadence as the janitor.
async fn run_consensus_sweep(
    consensus: Arc<ConsensusCoordinator>,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = consensus.expire_sweep().await {
                    warn!(error = %e, "consensus expire sweep failed");
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, TaskPayload};
    use crate::queue::EnqueueOutcome;
    use crate::store::InMemoryStore;

    /// A worker dies mid-task holding a lock; the janitor recovers both
    /// the task (back onto its tier) and the lock (released for reacquire).
    #[tokio::test]
    async fn janitor_recovers_orphaned_task_and_locks_of_a_dead_agent() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue_engine = QueueEngine::with_defaults(store.clone());
        let locks = FileLockManager::new(store.clone());
        let registry = AgentRegistry::new(store.clone());

        registry
            .register("agent-dead", BackendFamily::new("gpt"), vec!["gpt".to_string()], vec![])
            .await
            .unwrap();

        let outcome = queue_engine
            .enqueue(
                "gpt",
                TaskPayload {
                    file: "src/x.js".to_string(),
                    prompt: "refactor".to_string(),
                    task_type: None,
                },
                Priority::Normal,
            )
            .await
            .unwrap();
        let EnqueueOutcome::Accepted { task_id } = outcome else {
            panic!("expected accepted");
        };
        let (queue, _task) = queue_engine
            .dequeue(&["gpt".to_string()], 1)
            .await
            .unwrap()
            .expect("task available");

        locks.acquire("src/x.js", "agent-dead", 60).await.unwrap();
        registry
            .heartbeat("agent-dead", AgentStatus::Working, Some(task_id.clone()))
            .await
            .unwrap();

        let stale = registry.mark_unreachable("agent-dead").await.unwrap();
        assert_eq!(stale.current_task_id, Some(task_id.clone()));

        let recovered = queue_engine
            .recover_orphaned(&stale.queues[0], &task_id)
            .await
            .unwrap()
            .expect("orphaned task recovered");
        assert_eq!(recovered.attempts, 1);

        let released = locks.release_all_for_agent("agent-dead").await.unwrap();
        assert_eq!(released, 1);

        let (_, redequeued) = queue_engine
            .dequeue(&[queue], 1)
            .await
            .unwrap()
            .expect("recovered task dequeued again");
        assert_eq!(redequeued.id, task_id);

        let reacquired = locks.acquire("src/x.js", "agent-b", 60).await.unwrap();
        assert!(matches!(reacquired, AcquireOutcome::Granted { .. }));
    }

    /// An agent whose queue name differs from its backend family still gets
    /// its orphaned task recovered, because the janitor looks at the
    /// agent's registered queues rather than guessing from `backend`.
    #[tokio::test]
    async fn janitor_recovers_a_task_whose_queue_name_differs_from_the_backend() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let queue_engine = QueueEngine::with_defaults(store.clone());
        let registry = AgentRegistry::new(store.clone());

        registry
            .register(
                "agent-dead",
                BackendFamily::new("gpt"),
                vec!["team-frontend".to_string()],
                vec![],
            )
            .await
            .unwrap();

        let outcome = queue_engine
            .enqueue(
                "team-frontend",
                TaskPayload {
                    file: "src/x.js".to_string(),
                    prompt: "refactor".to_string(),
                    task_type: None,
                },
                Priority::Normal,
            )
            .await
            .unwrap();
        let EnqueueOutcome::Accepted { task_id } = outcome else {
            panic!("expected accepted");
        };
        queue_engine
            .dequeue(&["team-frontend".to_string()], 1)
            .await
            .unwrap()
            .expect("task available");

        registry
            .heartbeat("agent-dead", AgentStatus::Working, Some(task_id.clone()))
            .await
            .unwrap();
        let stale = registry.mark_unreachable("agent-dead").await.unwrap();

        let mut recovered = None;
        for queue in &stale.queues {
            if let Some(task) = queue_engine.recover_orphaned(queue, &task_id).await.unwrap() {
                recovered = Some(task);
                break;
            }
        }
        assert_eq!(recovered.expect("recovered from a queue").id, task_id);
    }
}
