//! Intent stage: layered classification with confidence arbitration.
//!
//! Order of evaluation, each step short-circuiting:
//!
//! 1. Safety filter (length, banned keywords) -> clarification
//! 2. Local keyword rules from the registry
//! 3. Cached model/API result for the same normalized text
//! 4. Model classifier and external classifier, run concurrently
//! 5. Arbitration: external API (above threshold) > model (above threshold)
//!    > `unrecognized`
//!
//! Collaborator failures are logged and treated as "no candidate". The stage
//! always returns an [`IntentResult`].

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::keys;
use crate::parse;
use crate::prompts;
use crate::text;
use crate::traits::external_api::IntentApi;
use crate::traits::model::{CompletionRequest, LanguageModel};
use crate::traits::store::{Store, StoreExt};
use crate::types::config::IntentConfig;
use crate::types::intent::{clamp_confidence, Entities, Intent, IntentRegistry, IntentResult};

/// A classification proposed by the model or the external API.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub intent: Intent,
    pub confidence: f64,
    pub entities: Entities,
}

/// Pick the winning candidate.
///
/// The external API wins when it clears its threshold, then the model when
/// it clears its own. Unrecognized candidates never win.
pub fn arbitrate(
    api: Option<&Candidate>,
    model: Option<&Candidate>,
    api_threshold: f64,
    model_threshold: f64,
) -> Option<Candidate> {
    let accept = |c: &&Candidate, threshold: f64| {
        !c.intent.is_unrecognized() && c.confidence >= threshold
    };
    api.filter(|c| accept(c, api_threshold))
        .or_else(|| model.filter(|c| accept(c, model_threshold)))
        .cloned()
}

/// Why the safety filter rejected an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    TooLong { length: usize, max: usize },
    BannedKeyword(String),
    Empty,
}

pub struct IntentStage {
    registry: Arc<IntentRegistry>,
    store: Arc<dyn Store>,
    model: Arc<dyn LanguageModel>,
    api: Option<Arc<dyn IntentApi>>,
    config: IntentConfig,
    system_prompt: String,
}

impl IntentStage {
    pub fn new(
        registry: Arc<IntentRegistry>,
        store: Arc<dyn Store>,
        model: Arc<dyn LanguageModel>,
        config: IntentConfig,
    ) -> Self {
        let system_prompt = prompts::classification_system_prompt(&registry);
        Self {
            registry,
            store,
            model,
            api: None,
            config,
            system_prompt,
        }
    }

    /// Attach a secondary classifier. Only consulted when enabled in config.
    pub fn with_api(mut self, api: Arc<dyn IntentApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn registry(&self) -> &IntentRegistry {
        &self.registry
    }

    pub fn config(&self) -> &IntentConfig {
        &self.config
    }

    /// Classify `text` for a session.
    pub async fn extract(&self, session_id: &str, text: &str) -> IntentResult {
        let start = Instant::now();
        let result = self.classify(session_id, text).await;
        info!(
            session_id,
            intent = %result.intent,
            confidence = result.confidence,
            clarification = result.clarification_needed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Intent extracted"
        );
        result
    }

    /// Check the raw input against the safety rules.
    pub fn check_safety(&self, raw: &str) -> Option<Rejection> {
        let length = text::char_len(raw);
        if length > self.config.max_input_length {
            return Some(Rejection::TooLong {
                length,
                max: self.config.max_input_length,
            });
        }
        let normalized = text::normalize(raw);
        if normalized.is_empty() {
            return Some(Rejection::Empty);
        }
        let lowered = normalized.to_lowercase();
        self.config
            .banned_keywords
            .iter()
            .filter(|k| !k.trim().is_empty())
            .find(|k| lowered.contains(&k.to_lowercase()))
            .map(|k| Rejection::BannedKeyword(k.clone()))
    }

    async fn classify(&self, session_id: &str, raw: &str) -> IntentResult {
        if let Some(rejection) = self.check_safety(raw) {
            warn!(session_id, ?rejection, "Input rejected by safety filter");
            return IntentResult::clarification(session_id, &self.config.clarification_prompt);
        }

        let normalized = text::normalize(raw);

        if let Some((def, keyword)) = self.registry.match_local(&normalized) {
            debug!(session_id, intent = %def.intent, keyword, "Local rule matched");
            return IntentResult::new(session_id, def.intent, self.config.local_rule_confidence)
                .with_entities(def.extract_entities(&normalized));
        }

        let cache_key = keys::intent_cache(&text::hash(&normalized));
        match self.store.get_json::<IntentResult>(&cache_key).await {
            Ok(Some(mut cached)) => {
                debug!(session_id, intent = %cached.intent, "Intent cache hit");
                cached.session_id = session_id.to_string();
                return cached;
            }
            Ok(None) => {}
            Err(e) => warn!(session_id, error = %e, "Intent cache read failed"),
        }

        let (model, api) = tokio::join!(self.ask_model(&normalized), self.ask_api(&normalized));

        let winner = arbitrate(
            api.as_ref(),
            model.as_ref(),
            self.config.api_confidence_threshold,
            self.config.model_confidence_threshold,
        );

        let result = match winner {
            Some(candidate) => {
                let mut entities = self
                    .registry
                    .get(candidate.intent)
                    .map(|def| def.extract_entities(&normalized))
                    .unwrap_or_default();
                // Classifier-supplied entities take precedence over rule-derived ones.
                entities.extend(candidate.entities);
                IntentResult::new(session_id, candidate.intent, candidate.confidence)
                    .with_entities(entities)
            }
            None => IntentResult::unrecognized(session_id),
        };

        // Transient failures are not cached so the next identical input retries.
        if model.is_some() || api.is_some() {
            if let Err(e) = self
                .store
                .set_json(&cache_key, &result, Some(self.config.cache_ttl()))
                .await
            {
                warn!(session_id, error = %e, "Intent cache write failed");
            }
        }

        result
    }

    async fn ask_model(&self, text: &str) -> Option<Candidate> {
        let request = CompletionRequest::new(format!("用户输入：{text}"), self.config.model.clone())
            .with_system(self.system_prompt.clone());

        let raw = match tokio::time::timeout(self.config.model_timeout(), self.model.complete(request))
            .await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(error = %e, "Intent model call failed");
                return None;
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.model_timeout_ms,
                    "Intent model call timed out"
                );
                return None;
            }
        };

        let Some(map) = parse::extract_object(&raw) else {
            warn!(response = %raw, "Intent model returned no JSON object");
            return None;
        };

        let label = map.get("intent").and_then(|v| v.as_str()).unwrap_or_default();
        let intent = self.registry.resolve_label(label);
        let confidence = if intent.is_unrecognized() {
            0.0
        } else {
            clamp_confidence(read_confidence(map.get("confidence")))
        };
        let entities = match map.get("entities") {
            Some(serde_json::Value::Object(obj)) => obj
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            _ => Entities::new(),
        };

        Some(Candidate {
            intent,
            confidence,
            entities,
        })
    }

    async fn ask_api(&self, text: &str) -> Option<Candidate> {
        if !self.config.external_api_enabled {
            return None;
        }
        let api = self.api.as_ref()?;

        match tokio::time::timeout(self.config.api_timeout(), api.classify(text)).await {
            Ok(Ok(classification)) => {
                let intent = self.registry.resolve_label(&classification.intent);
                Some(Candidate {
                    intent,
                    confidence: clamp_confidence(classification.confidence),
                    entities: classification.entities,
                })
            }
            Ok(Err(e)) => {
                warn!(error = %e, "External intent API failed");
                None
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.api_timeout_ms,
                    "External intent API timed out"
                );
                None
            }
        }
    }
}

fn read_confidence(value: Option<&serde_json::Value>) -> f64 {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}
