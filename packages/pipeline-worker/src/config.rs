use anyhow::{Context, Result};
use dotenvy::dotenv;
use query_pipeline::security::SecretString;
use query_pipeline::{Intent, PipelineConfig};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Worker configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub dashscope_api_key: SecretString,
    pub model_base_url: Option<String>,
    pub tavily_api_key: Option<SecretString>,
    pub intent_api_url: Option<String>,
    pub external_api_key: Option<SecretString>,
    pub external_endpoints: HashMap<Intent, String>,
    pub knowledge_path: Option<PathBuf>,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let dashscope_api_key = var("DASHSCOPE_API_KEY")
            .map(SecretString::from)
            .context("DASHSCOPE_API_KEY must be set")?;

        let mut pipeline = PipelineConfig::default();

        let intent = &mut pipeline.intent;
        if let Some(max) = parse(&var, "HP_SECURITY_MAX_QUERY_LENGTH")? {
            intent.max_input_length = max;
        }
        if let Some(list) = var("HP_SECURITY_BANNED_KEYWORDS") {
            intent.banned_keywords = split_list(&list);
        }
        if let Some(model) = var("INTENT_MODEL") {
            intent.model.model = model;
        }
        if let Some(temperature) = parse(&var, "INTENT_TEMPERATURE")? {
            intent.model.temperature = temperature;
        }
        let intent_api_url = var("INTENT_API_URL");
        intent.external_api_enabled = intent_api_url.is_some();

        let retrieval = &mut pipeline.retrieval;
        if let Some(enabled) = parse(&var, "WEB_SEARCH_ENABLED")? {
            retrieval.web_search_enabled = enabled;
        }
        if let Some(secs) = parse::<u64>(&var, "RETRIEVAL_TIMEOUT_SECS")? {
            retrieval.overall_timeout_ms = secs.saturating_mul(1_000);
        }
        if let Some(model) = var("RETRIEVAL_MODEL") {
            retrieval.model.model = model;
        }

        let generation = &mut pipeline.generation;
        if let Some(model) = var("GENERATION_MODEL") {
            generation.model.model = model;
        }
        if let Some(temperature) = parse(&var, "GENERATION_TEMPERATURE")? {
            generation.model.temperature = temperature;
        }
        if let Some(attempts) = parse(&var, "GENERATION_RETRY_ATTEMPTS")? {
            generation.retry_attempts = attempts;
        }

        if let Some(threshold) = parse(&var, "HP_FEEDBACK_RATING_ALERT_THRESHOLD")? {
            pipeline.feedback.rating_alert_threshold = threshold;
        }

        let external_endpoints: HashMap<Intent, String> = Intent::REGISTERED
            .iter()
            .filter_map(|intent| {
                let name = format!("EXTERNAL_API_{}_URL", intent.as_str().to_uppercase());
                var(&name).map(|url| (*intent, url))
            })
            .collect();
        pipeline.retrieval.external_api_enabled = !external_endpoints.is_empty();

        Ok(Self {
            dashscope_api_key,
            model_base_url: var("MODEL_BASE_URL"),
            tavily_api_key: var("TAVILY_API_KEY").map(SecretString::from),
            intent_api_url,
            external_api_key: var("EXTERNAL_API_KEY").map(SecretString::from),
            external_endpoints,
            knowledge_path: var("KNOWLEDGE_BASE_PATH").map(PathBuf::from),
            pipeline,
        })
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .with_context(|| format!("{name} has an invalid value: {raw}"))
        })
        .transpose()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
