use super::{ScoredMember, Store};
use crate::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

/// Redis-backed `Store` implementation. Connects once at startup through a
/// `ConnectionManager`, which transparently reconnects on transient network
/// failures — callers still see errors surfaced for the in-flight command,
/// but subsequent calls recover without manual re-dialing. Idempotent reads
/// are additionally retried in-process (see `retry_idempotent`) so a single
/// transient failure during reconnection doesn't need to surface to the
/// caller.
pub struct RedisStore {
    conn: ConnectionManager,
    client: redis::Client,
    acquire_lease_script: Script,
    release_lease_script: Script,
    move_tail_to_head_script: Script,
    subscriptions: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            client,
            acquire_lease_script: Script::new(ACQUIRE_LEASE_LUA),
            release_lease_script: Script::new(RELEASE_LEASE_LUA),
            move_tail_to_head_script: Script::new(MOVE_TAIL_TO_HEAD_LUA),
            subscriptions: Mutex::new(HashMap::new()),
        })
    }
}

/// Retries `f` with bounded exponential backoff, up to
/// `STORE_RETRY_MAX_ATTEMPTS` total attempts. Meant for idempotent reads
/// only — a mutating op retried this way could double-apply.
async fn retry_idempotent<T, F, Fut>(op: &'static str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < crate::constants::STORE_RETRY_MAX_ATTEMPTS => {
                let delay_ms = crate::constants::STORE_RETRY_BASE_DELAY_MS * 2u64.pow(attempt);
                warn!(op, attempt, delay_ms, error = %e, "retrying store read after transient error");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// Lua scripts give us atomic read-then-conditionally-write semantics
// without a full MULTI/WATCH retry loop.
const ACQUIRE_LEASE_LUA: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false or current == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
    return 1
end
return 0
"#;

const RELEASE_LEASE_LUA: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;

const MOVE_TAIL_TO_HEAD_LUA: &str = r#"
local value = redis.call('RPOP', KEYS[1])
if value then
    redis.call('LPUSH', KEYS[2], value)
end
return value
"#;

#[async_trait]
impl Store for RedisStore {
    async fn list_push_front(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(key, value).await?;
        Ok(())
    }

    async fn list_pop_back(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.rpop(key, None).await?)
    }

    async fn blocking_pop_back(
        &self,
        keys: &[String],
        timeout_secs: u64,
    ) -> Result<Option<(String, String)>> {
        let mut conn = self.conn.clone();
        let result: Option<(String, String)> = conn.brpop(keys, timeout_secs as f64).await?;
        Ok(result)
    }

    async fn list_atomic_move_tail_to_head(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = self
            .move_tail_to_head_script
            .key(src)
            .key(dst)
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn list_length(&self, key: &str) -> Result<u64> {
        retry_idempotent("list_length", || {
            let mut conn = self.conn.clone();
            async move { Ok(conn.llen(key).await?) }
        })
        .await
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        retry_idempotent("list_range", || {
            let mut conn = self.conn.clone();
            async move { Ok(conn.lrange(key, start, stop).await?) }
        })
        .await
    }

    async fn list_remove(&self, key: &str, count: i64, value: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.lrem(key, count as isize, value).await?)
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<ScoredMember>> {
        retry_idempotent("sorted_set_range_by_score", || {
            let mut conn = self.conn.clone();
            async move {
                let raw: Vec<(String, f64)> = conn.zrangebyscore_withscores(key, min, max).await?;
                Ok(raw
                    .into_iter()
                    .map(|(member, score)| ScoredMember { member, score })
                    .collect())
            }
        })
        .await
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zrem(key, member).await?;
        Ok(())
    }

    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        retry_idempotent("sorted_set_score", || {
            let mut conn = self.conn.clone();
            async move { Ok(conn.zscore(key, member).await?) }
        })
        .await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        retry_idempotent("hash_get", || {
            let mut conn = self.conn.clone();
            async move { Ok(conn.hget(key, field).await?) }
        })
        .await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        retry_idempotent("hash_get_all", || {
            let mut conn = self.conn.clone();
            async move { Ok(conn.hgetall(key).await?) }
        })
        .await
    }

    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.hincr(key, field, delta).await?)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(key, field).await?;
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        retry_idempotent("set_members", || {
            let mut conn = self.conn.clone();
            async move { Ok(conn.smembers(key).await?) }
        })
        .await
    }

    async fn string_set_nx_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let opts = redis::SetOptions::default()
            .conditional_set(redis::ExistenceCheck::NX)
            .with_expiration(redis::SetExpiry::EX(ttl_secs as usize));
        let result: Option<String> = conn.set_options(key, value, opts).await?;
        Ok(result.is_some())
    }

    async fn string_set_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn string_get(&self, key: &str) -> Result<Option<String>> {
        retry_idempotent("string_get", || {
            let mut conn = self.conn.clone();
            async move { Ok(conn.get(key).await?) }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        retry_idempotent("exists", || {
            let mut conn = self.conn.clone();
            async move { Ok(conn.exists(key).await?) }
        })
        .await
    }

    async fn ttl_secs(&self, key: &str) -> Result<Option<i64>> {
        retry_idempotent("ttl_secs", || {
            let mut conn = self.conn.clone();
            async move {
                let ttl: i64 = conn.ttl(key).await?;
                Ok(if ttl < 0 { None } else { Some(ttl) })
            }
        })
        .await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, message).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        let mut subs = self.subscriptions.lock().await;
        if let Some(tx) = subs.get(channel) {
            return tx.subscribe();
        }
        let (tx, rx) = broadcast::channel(256);
        subs.insert(channel.to_string(), tx.clone());
        drop(subs);

        let client = self.client.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "failed to open redis pubsub connection, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                if let Err(e) = pubsub.subscribe(channel.as_str()).await {
                    warn!(channel = %channel, error = %e, "failed to subscribe to redis channel, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                let mut stream = pubsub.on_message();
                while let Some(msg) = stream.next().await {
                    if let Ok(payload) = msg.get_payload::<String>() {
                        let _ = tx.send(payload);
                    }
                }
                warn!(channel = %channel, "redis pubsub stream ended, resubscribing");
            }
        });
        rx
    }

    async fn acquire_lease(&self, key: &str, owner: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: i64 = self
            .acquire_lease_script
            .key(key)
            .arg(owner)
            .arg(ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let released: i64 = self
            .release_lease_script
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn force_lease(&self, key: &str, owner: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, owner, ttl_secs).await?;
        Ok(())
    }
}
