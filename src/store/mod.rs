//! Store Adapter: a typed façade over the KV/pub-sub primitives
//! the rest of the core relies on. This is the sole I/O seam — everything
//! above it is deterministic given the adapter's responses.

mod memory_store;
mod redis_store;

pub use memory_store::InMemoryStore;
pub use redis_store::RedisStore;

use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// A single entry returned from a sorted-set range query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub member: String,
    pub score: f64,
}

/// Minimal typed vocabulary needed by the queue engine, lock manager,
/// registry, and consensus coordinator. `RedisStore` retries idempotent
/// reads internally with bounded exponential backoff; mutating ops and
/// `InMemoryStore` (which has no transient failures to retry) surface
/// errors directly.
#[async_trait]
pub trait Store: Send + Sync {
    // -- Lists -----------------------------------------------------------
    async fn list_push_front(&self, key: &str, value: &str) -> Result<()>;
    async fn list_pop_back(&self, key: &str) -> Result<Option<String>>;
    async fn blocking_pop_back(&self, keys: &[String], timeout_secs: u64)
        -> Result<Option<(String, String)>>;
    /// Atomically pops the tail of `src` and pushes it to the head of
    /// `dst`, returning the moved value if any. Used by the idle scavenger
    /// to claim work from `queue:todos` into `queue:todos:processing`.
    async fn list_atomic_move_tail_to_head(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<String>>;
    async fn list_length(&self, key: &str) -> Result<u64>;
    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    /// Removes up to `count` occurrences of `value` from `key` (0 = all).
    async fn list_remove(&self, key: &str, count: i64, value: &str) -> Result<u64>;

    // -- Sorted sets -------------------------------------------------------
    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<ScoredMember>>;
    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<()>;
    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<f64>>;

    // -- Hashes ------------------------------------------------------------
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64>;
    async fn hash_delete(&self, key: &str, field: &str) -> Result<()>;

    // -- Sets ----------------------------------------------------------------
    async fn set_add(&self, key: &str, member: &str) -> Result<()>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    // -- Strings -------------------------------------------------------------
    /// Sets `key` to `value` with a TTL, but only if `key` does not already
    /// hold an unexpired value (the building block for compare-and-set
    /// locks and dedup records). Returns `true` if the set happened.
    async fn string_set_nx_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;
    async fn string_set_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    async fn string_get(&self, key: &str) -> Result<Option<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn ttl_secs(&self, key: &str) -> Result<Option<i64>>;

    // -- Pub/sub ---------------------------------------------------------------
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Subscribes to `channel`, returning a receiver of every message
    /// published on it from this call onward. Repeated subscriptions to the
    /// same channel on the same store share one upstream subscription.
    async fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;

    // -- Atomic compare-and-set for leases (locks, votes) -----------------------
    /// Acquires `key` for `owner` with `ttl_secs` only if the key is absent
    /// or already owned by `owner`. Returns `true` on success. Implemented
    /// as a single Lua script against Redis so the check-then-write is
    /// atomic; the in-memory store holds a global mutex for the same
    /// effect.
    async fn acquire_lease(
        &self,
        key: &str,
        owner: &str,
        ttl_secs: u64,
    ) -> Result<bool>;

    /// Releases `key` only if currently owned by `owner`. Returns `true` if
    /// released.
    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool>;

    /// Unconditionally overwrites `key`'s ownership (force takeover).
    async fn force_lease(&self, key: &str, owner: &str, ttl_secs: u64) -> Result<()>;
}
