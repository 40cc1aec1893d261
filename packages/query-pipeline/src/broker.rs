//! Message broker: named channels and key layout over a [`Store`].
//!
//! Stages never talk to each other directly. The orchestrator publishes a
//! [`RetrievalRequest`] on the shared request channel and blocks on a
//! per-session result channel; the retrieval listener answers on exactly that
//! channel. Key builders live in [`keys`] so every component agrees on names.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::traits::store::{PubSub, Store, StoreExt, Subscription};
use crate::types::config::BrokerConfig;
use crate::types::generation::GenerationOutput;
use crate::types::intent::IntentResult;
use crate::types::retrieval::{RetrievalRequest, RetrievalResult};

/// Store key builders.
pub mod keys {
    pub fn intent(session_id: &str) -> String {
        format!("intent:{session_id}")
    }

    pub fn intent_cache(input_hash: &str) -> String {
        format!("llm_intent_cache:{input_hash}")
    }

    pub fn feedback(token: &str) -> String {
        format!("feedback:{token}")
    }

    pub fn feedback_processing(token: &str) -> String {
        format!("feedback:processing:{token}")
    }

    pub fn feedback_revised(token: &str) -> String {
        format!("feedback:revised:{token}")
    }

    pub fn feedback_rated(token: &str) -> String {
        format!("feedback:rated:{token}")
    }

    /// Number of feedback submissions accepted for a token.
    pub fn feedback_submissions(token: &str) -> String {
        format!("feedback:submissions:{token}")
    }

    /// The `n`th accepted submission for a token, counting from 1.
    pub fn feedback_submission(token: &str, n: i64) -> String {
        format!("feedback:submission:{token}:{n}")
    }

    pub fn final_result(session_id: &str) -> String {
        format!("final_result:{session_id}")
    }

    pub const RATINGS_COUNT: &str = "feedback:ratings:count";
    pub const RATINGS_SUM: &str = "feedback:ratings:sum";

    pub fn session_ratings(session_id: &str) -> String {
        format!("feedback:ratings:session:{session_id}")
    }
}

/// Notification sent on the intent channel after `intent:{sid}` is written.
#[derive(Debug, Clone, Serialize)]
struct IntentNotice<'a> {
    session_id: &'a str,
    intent: &'a str,
    confidence: f64,
}

/// Channel and cache operations used by the stages.
#[derive(Clone)]
pub struct MessageBroker {
    store: Arc<dyn Store>,
    config: BrokerConfig,
}

impl MessageBroker {
    pub fn new(store: Arc<dyn Store>, config: BrokerConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Channel carrying the result for one session.
    pub fn result_channel(&self, session_id: &str) -> String {
        format!("{}{}", self.config.result_prefix, session_id)
    }

    /// Persist the intent under `intent:{sid}` and announce it.
    pub async fn publish_intent(&self, intent: &IntentResult, ttl: Duration) -> Result<()> {
        self.store
            .set_json(&keys::intent(&intent.session_id), intent, Some(ttl))
            .await?;
        let notice = IntentNotice {
            session_id: &intent.session_id,
            intent: intent.intent.as_str(),
            confidence: intent.confidence,
        };
        self.store
            .publish(&self.config.intent_channel, serde_json::to_string(&notice)?)
            .await?;
        Ok(())
    }

    pub async fn get_intent(&self, session_id: &str) -> Result<Option<IntentResult>> {
        self.store.get_json(&keys::intent(session_id)).await
    }

    /// Publish a request on the shared channel. Returns the listener count.
    pub async fn publish_retrieval_request(&self, request: &RetrievalRequest) -> Result<usize> {
        let payload = serde_json::to_string(request)?;
        let listeners = self
            .store
            .publish(&self.config.request_channel, payload)
            .await?;
        debug!(
            session_id = %request.session_id,
            listeners,
            "Published retrieval request"
        );
        Ok(listeners)
    }

    pub async fn subscribe_retrieval_requests(&self) -> Result<Subscription> {
        self.store.subscribe(&self.config.request_channel).await
    }

    /// Subscribe to one session's result channel.
    ///
    /// Call this before publishing the request so the answer cannot be missed.
    pub async fn subscribe_retrieval_result(&self, session_id: &str) -> Result<Subscription> {
        self.store.subscribe(&self.result_channel(session_id)).await
    }

    pub async fn publish_retrieval_result(&self, result: &RetrievalResult) -> Result<usize> {
        let payload = serde_json::to_string(result)?;
        self.store
            .publish(&self.result_channel(&result.session_id), payload)
            .await
    }

    /// Wait for a result on a session subscription.
    ///
    /// Returns `None` on timeout, channel close, or an undecodable payload.
    pub async fn await_retrieval_result(
        &self,
        subscription: &mut Subscription,
        timeout: Duration,
    ) -> Option<RetrievalResult> {
        let raw = subscription.recv_timeout(timeout).await?;
        match serde_json::from_str(&raw) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(
                    channel = subscription.channel(),
                    error = %e,
                    "Discarding undecodable retrieval result"
                );
                None
            }
        }
    }

    /// Cache a final answer under `final_result:{sid}`.
    pub async fn cache_result(&self, output: &GenerationOutput) -> Result<()> {
        self.store
            .set_json(
                &keys::final_result(&output.session_id),
                output,
                Some(self.config.result_ttl()),
            )
            .await
    }

    pub async fn get_cached_result(&self, session_id: &str) -> Result<Option<GenerationOutput>> {
        self.store.get_json(&keys::final_result(session_id)).await
    }

    /// Publish an alert payload on the alert channel.
    pub async fn publish_alert<T: Serialize + Sync>(&self, alert: &T) -> Result<usize> {
        let payload = serde_json::to_string(alert)?;
        self.store
            .publish(&self.config.alert_channel, payload)
            .await
    }

    pub async fn subscribe_alerts(&self) -> Result<Subscription> {
        self.store.subscribe(&self.config.alert_channel).await
    }
}
