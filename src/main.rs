use anyhow::Result;
use coord_core::backend::circuit_breaker::CircuitBreakerConfig;
use coord_core::backend::{GuardedBackendClient, HttpBackendClient};
use coord_core::config::{Config, PriorityRules};
use coord_core::consensus::ConsensusCoordinator;
use coord_core::dispatcher::Dispatcher;
use coord_core::locks::FileLockManager;
use coord_core::models::BackendFamily;
use coord_core::queue::QueueEngine;
use coord_core::registry::AgentRegistry;
use coord_core::store::RedisStore;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("starting agent coordination core worker");

    let config = Config::load()?;
    let store = Arc::new(RedisStore::connect(&config.store_url).await?);

    let queue_engine = Arc::new(QueueEngine::new(
        store.clone(),
        config.dedup_ttl.as_secs(),
        config.starvation_threshold.as_secs() as i64,
        config.max_attempts,
    ));
    let locks = Arc::new(FileLockManager::new(store.clone()));
    let registry = Arc::new(AgentRegistry::new(store.clone()));
    let consensus = Arc::new(ConsensusCoordinator::new(store.clone()));

    // Priority-rules config, loaded once at startup and reloaded on SIGHUP.
    // Held for the lifetime of the process; enqueuing callers built on this
    // core resolve priority through `QueueEngine::enqueue_auto`.
    let priority_rules = Arc::new(RwLock::new(load_priority_rules(&config)));
    spawn_priority_rules_reloader(priority_rules, config.clone());

    let backend_endpoint = std::env::var("BACKEND_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:8089/invoke".to_string());
    let http_backend = HttpBackendClient::new(backend_endpoint, config.task_timeout)?;
    let backend_client = Arc::new(GuardedBackendClient::new(
        http_backend,
        CircuitBreakerConfig::default(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let dispatcher = Arc::new(Dispatcher::new(
        config.agent_id.clone(),
        BackendFamily::new(config.agent_type.clone()),
        vec![config.agent_type.clone()],
        store.clone(),
        queue_engine,
        locks,
        registry,
        consensus,
        backend_client,
        config.clone(),
    ));

    dispatcher.run(Vec::new(), shutdown_rx).await?;

    Ok(())
}

fn load_priority_rules(config: &Config) -> PriorityRules {
    match &config.priority_rules_path {
        Some(path) => PriorityRules::load_from_path(path).unwrap_or_else(|e| {
            warn!(path = %path, error = %e, "failed to load priority rules, using defaults");
            PriorityRules::default()
        }),
        None => PriorityRules::default(),
    }
}

#[cfg(unix)]
fn spawn_priority_rules_reloader(rules: Arc<RwLock<PriorityRules>>, config: Config) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let Ok(mut hangup) = signal(SignalKind::hangup()) else {
            warn!("failed to install SIGHUP handler, priority rules will not reload");
            return;
        };
        loop {
            hangup.recv().await;
            let reloaded = load_priority_rules(&config);
            *rules.write().await = reloaded;
            info!("priority rules reloaded on SIGHUP");
        }
    });
}

#[cfg(not(unix))]
fn spawn_priority_rules_reloader(_rules: Arc<RwLock<PriorityRules>>, _config: Config) {}
