//! Store adapter traits: key-value access with TTLs, plus publish/subscribe.
//!
//! The store is the only shared mutable substrate in the pipeline. All access
//! is by fully-qualified key; `set_if_absent` is the one atomic primitive.
//!
//! # Example
//!
//! ```rust,ignore
//! use query_pipeline::{MemoryStore, StoreExt};
//!
//! let store = MemoryStore::new();
//! store.set_json("intent:abc", &result, Some(Duration::from_secs(3600))).await?;
//! let cached: Option<IntentResult> = store.get_json("intent:abc").await?;
//! ```

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Key-value storage with per-key expiry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store a value, replacing any existing one. `None` means no expiry.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;

    /// Store a value only if the key is absent (or expired).
    ///
    /// Returns `true` if this call created the entry.
    async fn set_if_absent(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<bool>;

    /// Fetch a value; expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove a key. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Whether a live entry exists.
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Atomically add to an integer counter, creating it at zero.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;
}

/// A live subscription to one channel.
///
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    channel: String,
    stream: BoxStream<'static, String>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, stream: BoxStream<'static, String>) -> Self {
        Self {
            channel: channel.into(),
            stream,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.stream.next().await
    }

    /// Next payload within `timeout`; `None` on timeout or close.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.stream.next())
            .await
            .ok()
            .flatten()
    }

    pub fn into_stream(self) -> BoxStream<'static, String> {
        self.stream
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish()
    }
}

/// Named-channel publish/subscribe.
///
/// Delivery is at-most-once to subscribers that exist at publish time.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a payload. Returns the number of subscribers that received it.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize>;

    /// Subscribe to a channel. Messages published before this call are not seen.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// The full adapter: key-value storage plus pub/sub.
pub trait Store: KeyValueStore + PubSub {}

impl<T: KeyValueStore + PubSub + ?Sized> Store for T {}

/// Typed JSON helpers over any [`KeyValueStore`].
#[async_trait]
pub trait StoreExt: KeyValueStore {
    /// Serialize and store a value.
    async fn set_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        self.set(key, payload, ttl).await
    }

    /// Fetch and decode a value.
    ///
    /// A payload that fails to decode is an error, never a default.
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| PipelineError::Serialization {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }
}

impl<S: KeyValueStore + ?Sized> StoreExt for S {}
