//! Testing utilities including mock collaborators.
//!
//! Every mock records its calls so tests can assert on what a stage asked
//! for (and that it asked nothing at all on short-circuit paths).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::traits::{
    external_api::{ApiClassification, ExternalApi, IntentApi},
    knowledge::KnowledgeBase,
    model::{CompletionRequest, LanguageModel},
    searcher::WebSearcher,
};
use crate::types::intent::{Entities, Intent};
use crate::types::retrieval::{KnowledgeSnippet, WebHit};

/// Scripted language model.
///
/// Responses are matched by prompt substring in registration order, then the
/// default response. A prompt matching nothing is an error, which callers
/// treat like any model failure.
#[derive(Default)]
pub struct MockModel {
    responses: Vec<(String, String)>,
    default_response: Option<String>,
    delay: Option<Duration>,
    fail_first: usize,
    always_fail: bool,
    calls: Arc<RwLock<Vec<CompletionRequest>>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond with `response` to any prompt containing `pattern`.
    pub fn with_response(mut self, pattern: impl Into<String>, response: impl Into<String>) -> Self {
        self.responses.push((pattern.into(), response.into()));
        self
    }

    /// Respond with `response` when no pattern matches.
    pub fn with_default_response(mut self, response: impl Into<String>) -> Self {
        self.default_response = Some(response.into());
        self
    }

    /// Sleep before answering (use with paused time).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every call.
    pub fn failing(mut self) -> Self {
        self.always_fail = true;
        self
    }

    /// Fail the first `n` calls, then answer normally.
    pub fn failing_times(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }

    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.read().unwrap().clone()
    }

    /// Prompts received, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.calls
            .read()
            .unwrap()
            .iter()
            .map(|c| c.prompt.clone())
            .collect()
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let call_number = {
            let mut calls = self.calls.write().unwrap();
            calls.push(request.clone());
            calls.len()
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.always_fail || call_number <= self.fail_first {
            return Err(PipelineError::model_msg("mock model failure"));
        }

        self.responses
            .iter()
            .find(|(pattern, _)| request.prompt.contains(pattern.as_str()))
            .map(|(_, response)| response.clone())
            .or_else(|| self.default_response.clone())
            .ok_or_else(|| PipelineError::model_msg("no scripted response"))
    }
}

/// Knowledge base returning fixed snippets.
#[derive(Default)]
pub struct MockKnowledgeBase {
    snippets: Vec<KnowledgeSnippet>,
    by_intent: HashMap<Intent, Vec<KnowledgeSnippet>>,
    delay: Option<Duration>,
    fail: bool,
    calls: Arc<RwLock<Vec<(String, Intent)>>>,
}

impl MockKnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return this snippet for every intent.
    pub fn with_snippet(mut self, snippet: KnowledgeSnippet) -> Self {
        self.snippets.push(snippet);
        self
    }

    /// Return this snippet only for `intent`.
    pub fn with_intent_snippet(mut self, intent: Intent, snippet: KnowledgeSnippet) -> Self {
        self.by_intent.entry(intent).or_default().push(snippet);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }

    pub fn queries(&self) -> Vec<(String, Intent)> {
        self.calls.read().unwrap().clone()
    }
}

#[async_trait]
impl KnowledgeBase for MockKnowledgeBase {
    async fn search(
        &self,
        query: &str,
        intent: Intent,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<KnowledgeSnippet>> {
        self.calls.write().unwrap().push((query.to_string(), intent));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(PipelineError::Knowledge("mock knowledge base failure".into()));
        }

        let mut hits: Vec<KnowledgeSnippet> = self
            .by_intent
            .get(&intent)
            .into_iter()
            .flatten()
            .chain(self.snippets.iter())
            .filter(|s| s.score >= min_score)
            .cloned()
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }
}

/// Per-intent external API returning fixed payloads.
#[derive(Default)]
pub struct MockExternalApi {
    responses: HashMap<Intent, serde_json::Value>,
    delay: Option<Duration>,
    fail: bool,
    calls: Arc<RwLock<Vec<Intent>>>,
}

impl MockExternalApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, intent: Intent, data: serde_json::Value) -> Self {
        self.responses.insert(intent, data);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }
}

#[async_trait]
impl ExternalApi for MockExternalApi {
    async fn fetch(
        &self,
        intent: Intent,
        _entities: &Entities,
        _query: &str,
    ) -> Result<Option<serde_json::Value>> {
        self.calls.write().unwrap().push(intent);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(PipelineError::ExternalApi("mock api failure".into()));
        }
        Ok(self.responses.get(&intent).cloned())
    }
}

/// Web searcher returning fixed hits for every query.
#[derive(Default)]
pub struct MockWebSearcher {
    hits: Vec<WebHit>,
    fail: bool,
    queries: Arc<RwLock<Vec<String>>>,
}

impl MockWebSearcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hits(mut self, hits: Vec<WebHit>) -> Self {
        self.hits = hits;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.queries.read().unwrap().len()
    }

    /// Queries received, after rewriting.
    pub fn queries(&self) -> Vec<String> {
        self.queries.read().unwrap().clone()
    }
}

#[async_trait]
impl WebSearcher for MockWebSearcher {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<WebHit>> {
        self.queries.write().unwrap().push(query.to_string());
        if self.fail {
            return Err(PipelineError::WebSearch("mock search failure".into()));
        }
        Ok(self.hits.iter().take(limit).cloned().collect())
    }
}

/// Secondary classifier returning one fixed label.
#[derive(Default)]
pub struct MockIntentApi {
    result: Option<ApiClassification>,
    calls: Arc<RwLock<Vec<String>>>,
}

impl MockIntentApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, intent: impl Into<String>, confidence: f64) -> Self {
        self.result = Some(ApiClassification {
            intent: intent.into(),
            confidence,
            entities: Entities::new(),
        });
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }
}

#[async_trait]
impl IntentApi for MockIntentApi {
    async fn classify(&self, text: &str) -> Result<ApiClassification> {
        self.calls.write().unwrap().push(text.to_string());
        self.result
            .clone()
            .ok_or_else(|| PipelineError::ExternalApi("no scripted classification".into()))
    }
}
