use crate::models::Priority;
use crate::store::Store;
use crate::Result;
use std::collections::HashMap;

/// Scheduler state is kept entirely in the store (no in-process copy is
/// authoritative), under one hash per queue: `queue:<Q>:sched`, with
/// fields `tick` and `last_served:<priority>`.
fn sched_key(queue: &str) -> String {
    format!("queue:{queue}:sched")
}

/// Chooses the next priority tier to serve for `queue`, given the set of
/// tiers that currently have pending work. Implements the weighted
/// round-robin-with-starvation-override algorithm.
pub async fn select_priority(
    store: &dyn Store,
    queue: &str,
    non_empty: &[Priority],
    starvation_threshold_secs: i64,
    now_epoch_secs: i64,
) -> Result<Option<Priority>> {
    if non_empty.is_empty() {
        return Ok(None);
    }

    let key = sched_key(queue);
    let fields = store.hash_get_all(&key).await?;

    let mut sorted: Vec<Priority> = non_empty.to_vec();
    sorted.sort_by(|a, b| b.weight().partial_cmp(&a.weight()).unwrap());

    // Step 2: anti-starvation override.
    for &p in &sorted {
        let last_served = last_served_secs(&fields, p);
        if now_epoch_secs - last_served > starvation_threshold_secs {
            mark_served(store, &key, p, now_epoch_secs, &fields).await?;
            return Ok(Some(p));
        }
    }

    // Step 3: counter-gated weighted round robin.
    let tick: u64 = fields
        .get("tick")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    for &p in &sorted {
        if gate_open(p, tick) {
            mark_served(store, &key, p, now_epoch_secs, &fields).await?;
            return Ok(Some(p));
        }
    }

    // Step 4: fall back to the highest-weight non-empty tier.
    let fallback = sorted[0];
    mark_served(store, &key, fallback, now_epoch_secs, &fields).await?;
    Ok(Some(fallback))
}

fn last_served_secs(fields: &HashMap<String, String>, priority: Priority) -> i64 {
    fields
        .get(&format!("last_served:{}", priority.as_str()))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn gate_open(priority: Priority, tick: u64) -> bool {
    let weight = priority.weight();
    if weight >= 10.0 {
        true
    } else if weight >= 5.0 {
        tick % 2 == 0
    } else if weight >= 1.0 {
        tick % 5 == 0
    } else if weight >= 0.5 {
        tick % 10 == 0
    } else {
        tick % 20 == 0
    }
}

async fn mark_served(
    store: &dyn Store,
    sched_key: &str,
    priority: Priority,
    now_epoch_secs: i64,
    fields: &HashMap<String, String>,
) -> Result<()> {
    store
        .hash_set(
            sched_key,
            &format!("last_served:{}", priority.as_str()),
            &now_epoch_secs.to_string(),
        )
        .await?;
    let _ = fields;
    store.hash_incr_by(sched_key, "tick", 1).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn critical_always_passes_the_gate() {
        let store = InMemoryStore::new();
        let picked = select_priority(&store, "q", &[Priority::Critical, Priority::Normal], 300, 0)
            .await
            .unwrap();
        assert_eq!(picked, Some(Priority::Critical));
    }

    #[tokio::test]
    async fn starved_tier_is_forced_even_if_lower_weight() {
        let store = InMemoryStore::new();
        // Normal is served at t=0, never again; by t=301 it should be forced
        // ahead of critical which keeps getting served.
        store
            .hash_set("queue:q:sched", "last_served:normal", "0")
            .await
            .unwrap();
        store
            .hash_set("queue:q:sched", "last_served:critical", "300")
            .await
            .unwrap();
        let picked = select_priority(
            &store,
            "q",
            &[Priority::Critical, Priority::Normal],
            300,
            301,
        )
        .await
        .unwrap();
        assert_eq!(picked, Some(Priority::Normal));
    }

    #[tokio::test]
    async fn empty_tiers_yield_none() {
        let store = InMemoryStore::new();
        let picked = select_priority(&store, "q", &[], 300, 0).await.unwrap();
        assert_eq!(picked, None);
    }
}
