//! Configuration types for the pipeline stages.
//!
//! Durations are stored as plain integers (`*_ms`, `*_secs`) so the structs
//! serialize cleanly; use the accessor methods to get a `Duration`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sampling parameters for one model role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl GenerationParams {
    pub fn new(model: impl Into<String>, temperature: f32, max_tokens: u32, top_p: f32) -> Self {
        Self {
            model: model.into(),
            temperature,
            max_tokens,
            top_p,
        }
    }

    /// Parameters for intent classification.
    pub fn intent() -> Self {
        Self::new("qwen-max", 0.0, 1024, 0.9)
    }

    /// Parameters for retrieval integration and query rewriting.
    pub fn retrieval() -> Self {
        Self::new("qwen-max", 0.1, 2048, 0.9)
    }

    /// Parameters for answer generation.
    pub fn generation() -> Self {
        Self::new("qwen-plus", 0.7, 2048, 0.9)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Configuration for intent classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentConfig {
    /// Inputs longer than this (in characters) are rejected. Default: 200.
    pub max_input_length: usize,

    /// Substrings that cause immediate rejection.
    #[serde(default)]
    pub banned_keywords: Vec<String>,

    /// Confidence assigned to local keyword matches. Default: 0.9.
    pub local_rule_confidence: f64,

    /// Minimum confidence for the external classifier. Default: 0.5.
    pub api_confidence_threshold: f64,

    /// Minimum confidence for the model classifier. Default: 0.6.
    pub model_confidence_threshold: f64,

    /// Consult the external classifier API. Default: false.
    pub external_api_enabled: bool,

    /// TTL for `llm_intent_cache:{hash}` entries.
    pub cache_ttl_secs: u64,

    /// TTL for `intent:{session_id}` entries.
    pub intent_ttl_secs: u64,

    /// Ceiling on the model call.
    pub model_timeout_ms: u64,

    /// Ceiling on the external classifier call.
    pub api_timeout_ms: u64,

    /// Prompt returned when the input is rejected.
    pub clarification_prompt: String,

    pub model: GenerationParams,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            max_input_length: 200,
            banned_keywords: vec![],
            local_rule_confidence: 0.9,
            api_confidence_threshold: 0.5,
            model_confidence_threshold: 0.6,
            external_api_enabled: false,
            cache_ttl_secs: 3600,
            intent_ttl_secs: 3600,
            model_timeout_ms: 5_000,
            api_timeout_ms: 5_000,
            clarification_prompt: "抱歉，我没能理解您的问题。请换一种说法，或者把问题描述得更简短具体一些。"
                .to_string(),
            model: GenerationParams::intent(),
        }
    }
}

impl IntentConfig {
    pub fn with_max_input_length(mut self, max: usize) -> Self {
        self.max_input_length = max;
        self
    }

    pub fn with_banned_keywords(mut self, keywords: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.banned_keywords = keywords.into_iter().map(|k| k.into()).collect();
        self
    }

    pub fn with_external_api(mut self, enabled: bool) -> Self {
        self.external_api_enabled = enabled;
        self
    }

    pub fn with_model_timeout_ms(mut self, ms: u64) -> Self {
        self.model_timeout_ms = ms;
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn intent_ttl(&self) -> Duration {
        Duration::from_secs(self.intent_ttl_secs)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }
}

/// Configuration for the retrieval fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Ceiling on each sub-task (knowledge, API, web). Default: 5s.
    pub subtask_timeout_ms: u64,

    /// Ceiling on the whole fan-out. Default: 15s.
    pub overall_timeout_ms: u64,

    /// Ceiling on the integration call.
    pub integration_timeout_ms: u64,

    /// Knowledge store result count. Default: 5.
    pub top_k: usize,

    /// Knowledge store score floor. Default: 0.7.
    pub min_score: f32,

    /// Global switch for web search. Default: false.
    pub web_search_enabled: bool,

    /// Web hits kept per search.
    pub web_result_limit: usize,

    /// Call per-intent external APIs. Default: false.
    pub external_api_enabled: bool,

    /// Requests processed concurrently by the listener. Default: 5.
    pub listener_concurrency: usize,

    pub model: GenerationParams,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            subtask_timeout_ms: 5_000,
            overall_timeout_ms: 15_000,
            integration_timeout_ms: 15_000,
            top_k: 5,
            min_score: 0.7,
            web_search_enabled: false,
            web_result_limit: 5,
            external_api_enabled: false,
            listener_concurrency: 5,
            model: GenerationParams::retrieval(),
        }
    }
}

impl RetrievalConfig {
    pub fn with_web_search(mut self, enabled: bool) -> Self {
        self.web_search_enabled = enabled;
        self
    }

    pub fn with_external_api(mut self, enabled: bool) -> Self {
        self.external_api_enabled = enabled;
        self
    }

    pub fn with_subtask_timeout_ms(mut self, ms: u64) -> Self {
        self.subtask_timeout_ms = ms;
        self
    }

    pub fn with_overall_timeout_ms(mut self, ms: u64) -> Self {
        self.overall_timeout_ms = ms;
        self
    }

    pub fn subtask_timeout(&self) -> Duration {
        Duration::from_millis(self.subtask_timeout_ms)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }

    pub fn integration_timeout(&self) -> Duration {
        Duration::from_millis(self.integration_timeout_ms)
    }
}

/// Configuration for answer generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Attempts for the synthesis call, including the first. Default: 3.
    pub retry_attempts: u32,

    /// Fixed delay between attempts. Default: 2s.
    pub retry_delay_ms: u64,

    /// Ceiling on each synthesis attempt.
    pub model_timeout_ms: u64,

    /// TTL for `feedback:{token}` records.
    pub record_ttl_secs: u64,

    /// Answer for unrecognized intents.
    pub unrecognized_answer: String,

    /// Answer when an intent has no prompt template.
    pub unconfigured_answer: String,

    /// Answer when the model fails after all retries.
    pub failure_answer: String,

    pub model: GenerationParams,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay_ms: 2_000,
            model_timeout_ms: 30_000,
            record_ttl_secs: 86_400,
            unrecognized_answer: "抱歉，我暂时无法理解您的问题。您可以询问场馆开放时间、赛事报名、体育课程、体测标准、课外锻炼或运动建议等内容。"
                .to_string(),
            unconfigured_answer: "抱歉，系统尚未完全配置，暂时无法回答这类问题，请稍后再试。"
                .to_string(),
            failure_answer: "抱歉，生成回答时出现问题，请稍后再试。".to_string(),
            model: GenerationParams::generation(),
        }
    }
}

impl GenerationConfig {
    pub fn with_retry(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }

    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs)
    }
}

/// Configuration for feedback handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Ratings at or below this publish an alert. Default: 2.
    pub rating_alert_threshold: u8,

    /// Maximum suggestion length in characters. Default: 500.
    pub max_suggestion_length: usize,

    /// TTL of the revision lock. Default: 300s.
    pub processing_ttl_secs: u64,

    /// TTL for `feedback:revised:{token}`.
    pub revised_ttl_secs: u64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            rating_alert_threshold: 2,
            max_suggestion_length: 500,
            processing_ttl_secs: 300,
            revised_ttl_secs: 86_400,
        }
    }
}

impl FeedbackConfig {
    pub fn with_alert_threshold(mut self, threshold: u8) -> Self {
        self.rating_alert_threshold = threshold;
        self
    }

    pub fn processing_ttl(&self) -> Duration {
        Duration::from_secs(self.processing_ttl_secs)
    }

    pub fn revised_ttl(&self) -> Duration {
        Duration::from_secs(self.revised_ttl_secs)
    }
}

/// Channel names and orchestration waits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Shared request channel. Default: `retrieval_requests`.
    pub request_channel: String,

    /// Prefix for per-session result channels. Default: `retrieval_result:`.
    pub result_prefix: String,

    /// Intent notification channel. Default: `intent_updates`.
    pub intent_channel: String,

    /// Low-rating alert channel. Default: `feedback:alerts`.
    pub alert_channel: String,

    /// How long the orchestrator waits for its retrieval result. Default: 30s.
    pub result_wait_ms: u64,

    /// TTL for `final_result:{session_id}`. Default: 3600s.
    pub result_ttl_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            request_channel: "retrieval_requests".to_string(),
            result_prefix: "retrieval_result:".to_string(),
            intent_channel: "intent_updates".to_string(),
            alert_channel: "feedback:alerts".to_string(),
            result_wait_ms: 30_000,
            result_ttl_secs: 3600,
        }
    }
}

impl BrokerConfig {
    pub fn with_result_wait_ms(mut self, ms: u64) -> Self {
        self.result_wait_ms = ms;
        self
    }

    pub fn result_wait(&self) -> Duration {
        Duration::from_millis(self.result_wait_ms)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub intent: IntentConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_intent(mut self, intent: IntentConfig) -> Self {
        self.intent = intent;
        self
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_feedback(mut self, feedback: FeedbackConfig) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn with_broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.intent.max_input_length, 200);
        assert_eq!(config.intent.local_rule_confidence, 0.9);
        assert_eq!(config.retrieval.overall_timeout(), Duration::from_secs(15));
        assert_eq!(config.generation.retry_attempts, 3);
        assert_eq!(config.feedback.rating_alert_threshold, 2);
        assert_eq!(config.broker.request_channel, "retrieval_requests");
    }

    #[test]
    fn test_partial_config_deserializes_with_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"feedback": {"rating_alert_threshold": 1, "max_suggestion_length": 100, "processing_ttl_secs": 60, "revised_ttl_secs": 60}}"#)
                .unwrap();
        assert_eq!(config.feedback.rating_alert_threshold, 1);
        assert_eq!(config.intent.max_input_length, 200);
    }
}
