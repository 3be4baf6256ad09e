use super::{ScoredMember, Store};
use crate::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};

#[derive(Default)]
struct Data {
    lists: HashMap<String, VecDeque<String>>,
    sorted_sets: HashMap<String, HashMap<String, f64>>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    strings: HashMap<String, (String, Option<Instant>)>,
}

/// Deterministic, single-process `Store` implementation used by the test
/// suite. Holds everything behind one mutex: it trades throughput for the
/// simplicity of giving every operation the same atomicity guarantees the
/// Lua-scripted Redis paths provide.
pub struct InMemoryStore {
    data: Mutex<Data>,
    notify: broadcast::Sender<()>,
    pubsub: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        let (notify, _) = broadcast::channel(256);
        Self {
            data: Mutex::new(Data::default()),
            notify,
            pubsub: Mutex::new(HashMap::new()),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_expired(entry: &(String, Option<Instant>)) -> bool {
        matches!(entry.1, Some(expiry) if Instant::now() >= expiry)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn list_push_front(&self, key: &str, value: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        data.lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        drop(data);
        let _ = self.notify.send(());
        Ok(())
    }

    async fn list_pop_back(&self, key: &str) -> Result<Option<String>> {
        let mut data = self.data.lock().await;
        Ok(data.lists.get_mut(key).and_then(|l| l.pop_back()))
    }

    async fn blocking_pop_back(
        &self,
        keys: &[String],
        timeout_secs: u64,
    ) -> Result<Option<(String, String)>> {
        let deadline = Instant::now() + Duration::from_secs(timeout_secs.max(1));
        loop {
            {
                let mut data = self.data.lock().await;
                for key in keys {
                    if let Some(value) = data.lists.get_mut(key).and_then(|l| l.pop_back()) {
                        return Ok(Some((key.clone(), value)));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let mut rx = self.notify.subscribe();
            let _ = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        }
    }

    async fn list_atomic_move_tail_to_head(
        &self,
        src: &str,
        dst: &str,
    ) -> Result<Option<String>> {
        let mut data = self.data.lock().await;
        let value = data.lists.get_mut(src).and_then(|l| l.pop_back());
        if let Some(ref v) = value {
            data.lists
                .entry(dst.to_string())
                .or_default()
                .push_front(v.clone());
        }
        Ok(value)
    }

    async fn list_length(&self, key: &str) -> Result<u64> {
        let data = self.data.lock().await;
        Ok(data.lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let data = self.data.lock().await;
        let Some(list) = data.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        if len == 0 {
            return Ok(Vec::new());
        }
        let norm = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len - 1)
            }
        };
        let start = norm(start);
        let stop = norm(stop);
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn list_remove(&self, key: &str, count: i64, value: &str) -> Result<u64> {
        let mut data = self.data.lock().await;
        let Some(list) = data.lists.get_mut(key) else {
            return Ok(0);
        };
        let mut removed = 0u64;
        let limit = if count <= 0 { usize::MAX } else { count as usize };
        list.retain(|item| {
            if removed as usize >= limit || item != value {
                true
            } else {
                removed += 1;
                false
            }
        });
        Ok(removed)
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut data = self.data.lock().await;
        data.sorted_sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<ScoredMember>> {
        let data = self.data.lock().await;
        let Some(set) = data.sorted_sets.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<ScoredMember> = set
            .iter()
            .filter(|(_, &score)| score >= min && score <= max)
            .map(|(member, &score)| ScoredMember {
                member: member.clone(),
                score,
            })
            .collect();
        members.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap());
        Ok(members)
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        if let Some(set) = data.sorted_sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn sorted_set_score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let data = self.data.lock().await;
        Ok(data
            .sorted_sets
            .get(key)
            .and_then(|set| set.get(member))
            .copied())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        data.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let data = self.data.lock().await;
        Ok(data.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let data = self.data.lock().await;
        Ok(data.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut data = self.data.lock().await;
        let hash = data.hashes.entry(key.to_string()).or_default();
        let current = hash
            .get(field)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let updated = current + delta;
        hash.insert(field.to_string(), updated.to_string());
        Ok(updated)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        if let Some(hash) = data.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        data.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        if let Some(set) = data.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let data = self.data.lock().await;
        Ok(data
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn string_set_nx_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut data = self.data.lock().await;
        let occupied = data
            .strings
            .get(key)
            .map(|entry| !Self::is_expired(entry))
            .unwrap_or(false);
        if occupied {
            return Ok(false);
        }
        let expiry = Some(Instant::now() + Duration::from_secs(ttl_secs));
        data.strings
            .insert(key.to_string(), (value.to_string(), expiry));
        Ok(true)
    }

    async fn string_set_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut data = self.data.lock().await;
        let expiry = Some(Instant::now() + Duration::from_secs(ttl_secs));
        data.strings
            .insert(key.to_string(), (value.to_string(), expiry));
        Ok(())
    }

    async fn string_get(&self, key: &str) -> Result<Option<String>> {
        let data = self.data.lock().await;
        Ok(data.strings.get(key).and_then(|entry| {
            if Self::is_expired(entry) {
                None
            } else {
                Some(entry.0.clone())
            }
        }))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut data = self.data.lock().await;
        data.strings.remove(key);
        data.lists.remove(key);
        data.sorted_sets.remove(key);
        data.hashes.remove(key);
        data.sets.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let data = self.data.lock().await;
        Ok(data
            .strings
            .get(key)
            .map(|entry| !Self::is_expired(entry))
            .unwrap_or(false)
            || data.lists.contains_key(key)
            || data.sorted_sets.contains_key(key)
            || data.hashes.contains_key(key)
            || data.sets.contains_key(key))
    }

    async fn ttl_secs(&self, key: &str) -> Result<Option<i64>> {
        let data = self.data.lock().await;
        Ok(data.strings.get(key).and_then(|entry| match entry.1 {
            Some(expiry) => {
                let remaining = expiry.saturating_duration_since(Instant::now());
                Some(remaining.as_secs() as i64)
            }
            None => None,
        }))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let pubsub = self.pubsub.lock().await;
        if let Some(sender) = pubsub.get(channel) {
            let _ = sender.send(message.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        let mut pubsub = self.pubsub.lock().await;
        pubsub
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    async fn acquire_lease(&self, key: &str, owner: &str, ttl_secs: u64) -> Result<bool> {
        let mut data = self.data.lock().await;
        let free = match data.strings.get(key) {
            Some(entry) if !Self::is_expired(entry) => entry.0 == owner,
            _ => true,
        };
        if !free {
            return Ok(false);
        }
        let expiry = Some(Instant::now() + Duration::from_secs(ttl_secs));
        data.strings
            .insert(key.to_string(), (owner.to_string(), expiry));
        Ok(true)
    }

    async fn release_lease(&self, key: &str, owner: &str) -> Result<bool> {
        let mut data = self.data.lock().await;
        let matches = data
            .strings
            .get(key)
            .map(|entry| !Self::is_expired(entry) && entry.0 == owner)
            .unwrap_or(false);
        if matches {
            data.strings.remove(key);
        }
        Ok(matches)
    }

    async fn force_lease(&self, key: &str, owner: &str, ttl_secs: u64) -> Result<()> {
        let mut data = self.data.lock().await;
        let expiry = Some(Instant::now() + Duration::from_secs(ttl_secs));
        data.strings
            .insert(key.to_string(), (owner.to_string(), expiry));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_lease_rejects_other_owner_until_released() {
        let store = InMemoryStore::new();
        assert!(store.acquire_lease("lock:a", "agent-1", 10).await.unwrap());
        assert!(!store.acquire_lease("lock:a", "agent-2", 10).await.unwrap());
        assert!(store.release_lease("lock:a", "agent-1").await.unwrap());
        assert!(store.acquire_lease("lock:a", "agent-2", 10).await.unwrap());
    }

    #[tokio::test]
    async fn move_tail_to_head_transfers_single_element() {
        let store = InMemoryStore::new();
        store.list_push_front("src", "a").await.unwrap();
        store.list_push_front("src", "b").await.unwrap();
        let moved = store
            .list_atomic_move_tail_to_head("src", "dst")
            .await
            .unwrap();
        assert_eq!(moved, Some("a".to_string()));
        assert_eq!(store.list_length("dst").await.unwrap(), 1);
        assert_eq!(store.list_length("src").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sorted_set_range_by_score_is_ordered() {
        let store = InMemoryStore::new();
        store.sorted_set_add("z", "c", 3.0).await.unwrap();
        store.sorted_set_add("z", "a", 1.0).await.unwrap();
        store.sorted_set_add("z", "b", 2.0).await.unwrap();
        let range = store.sorted_set_range_by_score("z", 0.0, 10.0).await.unwrap();
        let members: Vec<String> = range.into_iter().map(|m| m.member).collect();
        assert_eq!(members, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn string_set_nx_ttl_respects_existing_key() {
        let store = InMemoryStore::new();
        assert!(store.string_set_nx_ttl("k", "v1", 10).await.unwrap());
        assert!(!store.string_set_nx_ttl("k", "v2", 10).await.unwrap());
        assert_eq!(store.string_get("k").await.unwrap(), Some("v1".to_string()));
    }
}
