//! Orchestrator: one session from query to answer.
//!
//! `extract intent -> publish request -> await result -> generate -> cache`.
//!
//! The orchestrator never calls the retrieval stage directly. It subscribes
//! to the session's result channel *before* publishing the request, then
//! waits a bounded time. A missing, late, or undecodable result degrades to
//! an error-status placeholder and generation proceeds anyway.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::MessageBroker;
use crate::error::Result;
use crate::stages::{GenerationStage, IntentStage};
use crate::types::generation::{GenerationInput, GenerationOutput};
use crate::types::intent::IntentResult;
use crate::types::retrieval::{RetrievalRequest, RetrievalResult};

pub struct Orchestrator {
    intent: Arc<IntentStage>,
    generation: Arc<GenerationStage>,
    broker: MessageBroker,
    use_web: bool,
}

impl Orchestrator {
    pub fn new(intent: Arc<IntentStage>, generation: Arc<GenerationStage>, broker: MessageBroker) -> Self {
        Self {
            intent,
            generation,
            broker,
            use_web: false,
        }
    }

    /// Ask retrieval to consult the web for every request.
    pub fn with_web(mut self, use_web: bool) -> Self {
        self.use_web = use_web;
        self
    }

    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    /// Answer one query. Never fails; degraded paths still yield an answer
    /// and a feedback token.
    pub async fn process(&self, session_id: Option<&str>, query: &str) -> GenerationOutput {
        let start = Instant::now();
        let session_id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let intent = self.intent.extract(&session_id, query).await;
        if let Err(e) = self
            .broker
            .publish_intent(&intent, self.intent.config().intent_ttl())
            .await
        {
            warn!(session_id = %session_id, error = %e, "Failed to publish intent");
        }

        let input = if intent.clarification_needed {
            debug!(session_id = %session_id, "Clarification needed, skipping retrieval");
            GenerationInput::without_retrieval(&intent, query)
        } else {
            let retrieval = self.retrieve(&intent, query).await;
            GenerationInput::from_stages(&intent, query, &retrieval)
        };

        let output = self.generation.generate(input).await;

        if let Err(e) = self.broker.cache_result(&output).await {
            error!(session_id = %session_id, error = %e, "Failed to cache final result");
        }

        info!(
            session_id = %session_id,
            intent = %intent.intent,
            confidence = intent.confidence,
            status = ?output.status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Session complete"
        );
        output
    }

    async fn retrieve(&self, intent: &IntentResult, query: &str) -> RetrievalResult {
        let session_id = intent.session_id.as_str();
        match self.request_retrieval(intent, query).await {
            Ok(Some(result)) => result,
            Ok(None) => {
                warn!(session_id, "No retrieval result within the wait window");
                RetrievalResult::degraded(session_id, "retrieval timed out")
            }
            Err(e) => {
                error!(session_id, error = %e, "Retrieval request failed");
                RetrievalResult::degraded(session_id, "retrieval unavailable")
            }
        }
    }

    async fn request_retrieval(&self, intent: &IntentResult, query: &str) -> Result<Option<RetrievalResult>> {
        // Subscribe first so the answer cannot race past us.
        let mut results = self
            .broker
            .subscribe_retrieval_result(&intent.session_id)
            .await?;

        let request = RetrievalRequest::from_intent(intent, query).with_web(self.use_web);
        let listeners = self.broker.publish_retrieval_request(&request).await?;
        if listeners == 0 {
            warn!(session_id = %intent.session_id, "No retrieval listener subscribed");
            return Ok(None);
        }

        Ok(self
            .broker
            .await_retrieval_result(&mut results, self.broker.config().result_wait())
            .await)
    }

    /// Previously computed answer for a session, if still cached.
    pub async fn cached_result(&self, session_id: &str) -> Result<Option<GenerationOutput>> {
        self.broker.get_cached_result(session_id).await
    }
}
