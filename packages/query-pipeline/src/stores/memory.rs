//! In-process store: TTL'd key-value entries plus topic-keyed broadcast channels.
//!
//! Suitable for a single process running the orchestrator and the retrieval
//! listener side by side, and for tests. Data is lost on restart.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::traits::store::{KeyValueStore, PubSub, Subscription};

/// Default per-channel buffer before slow subscribers start lagging.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory [`KeyValueStore`] and [`PubSub`].
///
/// Cloning shares the underlying maps. Expired entries are dropped lazily on
/// access and eagerly by [`MemoryStore::purge_expired`].
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, StoredValue>>,
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create an empty store with the given per-channel buffer.
    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Drop expired entries and channels nobody listens to.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.is_expired(now));
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
        before.saturating_sub(self.entries.len())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current subscriber count for a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.entries
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<bool> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredValue::new(value, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, v| v.is_expired(now));
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, v)| !v.is_expired(now)))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::new("0".to_string(), None));
        if entry.is_expired(now) {
            *entry = StoredValue::new("0".to_string(), None);
        }
        let current: i64 = entry.value.parse().map_err(|_| {
            PipelineError::storage_msg(format!("value at {key} is not an integer"))
        })?;
        let next = current + delta;
        entry.value = next.to_string();
        Ok(next)
    }
}

#[async_trait]
impl PubSub for MemoryStore {
    async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
        let delivered = match self.channels.get(channel) {
            Some(tx) => tx.send(payload).unwrap_or(0),
            None => 0,
        };
        if delivered == 0 {
            // Channel entry with no subscribers left; drop it.
            self.channels
                .remove_if(channel, |_, tx| tx.receiver_count() == 0);
        }
        debug!(channel, delivered, "Published message");
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let name = channel.to_string();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(payload) => yield payload,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(channel = %name, skipped, "Subscriber lagged, messages dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };

        Ok(Subscription::new(channel, Box::pin(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::store::StoreExt;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("k", "v".into(), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(store.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_set_if_absent_only_first_wins() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("lock", "a".into(), None).await.unwrap());
        assert!(!store.set_if_absent("lock", "b".into(), None).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_reclaims_expired() {
        let store = MemoryStore::new();
        assert!(store
            .set_if_absent("lock", "a".into(), Some(Duration::from_secs(1)))
            .await
            .unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.set_if_absent("lock", "b".into(), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_if_absent_is_atomic_under_contention() {
        let store = MemoryStore::new();
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .set_if_absent("contended", i.to_string(), None)
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_incr_by() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by("count", 1).await.unwrap(), 1);
        assert_eq!(store.incr_by("count", 4).await.unwrap(), 5);
        assert_eq!(store.incr_by("count", -2).await.unwrap(), 3);

        store.set("text", "abc".into(), None).await.unwrap();
        assert!(store.incr_by("text", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_get_json_reports_corruption() {
        let store = MemoryStore::new();
        store.set("bad", "{not json".into(), None).await.unwrap();
        let err = store.get_json::<serde_json::Value>("bad").await.unwrap_err();
        match err {
            PipelineError::Serialization { key, .. } => assert_eq!(key, "bad"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe_roundtrip() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("topic").await.unwrap();
        assert_eq!(store.publish("topic", "hello".into()).await.unwrap(), 1);
        assert_eq!(sub.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let store = MemoryStore::new();
        assert_eq!(store.publish("nobody", "dropped".into()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let store = MemoryStore::new();
        let mut a = store.subscribe("retrieval_result:a").await.unwrap();
        let mut b = store.subscribe("retrieval_result:b").await.unwrap();
        store
            .publish("retrieval_result:b", "for-b".into())
            .await
            .unwrap();
        assert_eq!(b.recv().await.as_deref(), Some("for-b"));
        assert_eq!(a.recv_timeout(Duration::from_millis(20)).await, None);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let store = MemoryStore::new();
        let sub = store.subscribe("topic").await.unwrap();
        assert_eq!(store.subscriber_count("topic"), 1);
        drop(sub);
        assert_eq!(store.subscriber_count("topic"), 0);
        store.purge_expired();
        assert!(store.channels.is_empty());
    }
}
