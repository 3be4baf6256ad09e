//! Idle-time scavenger: claims work from the global `queue:todos` pool into
//! `queue:todos:processing` when a worker would otherwise sit idle.

use crate::store::Store;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

const TODOS_KEY: &str = "queue:todos";
const TODOS_PROCESSING_KEY: &str = "queue:todos:processing";

pub async fn run_scavenger(store: Arc<dyn Store>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
        crate::constants::SCAVENGER_INTERVAL_SECS,
    ));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.list_atomic_move_tail_to_head(TODOS_KEY, TODOS_PROCESSING_KEY).await {
                    Ok(Some(item)) => debug!(item, "scavenger claimed idle todo item"),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "scavenger poll failed"),
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}
