//! HTTP collaborators: per-intent data endpoints and a secondary classifier.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::security::SecretString;
use crate::traits::external_api::{ApiClassification, ExternalApi, IntentApi};
use crate::types::intent::{Entities, Intent};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

fn client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {e}")))
}

/// Entity values flattened into query parameters.
fn query_params(entities: &Entities, query: &str) -> Vec<(String, String)> {
    let mut params = vec![("q".to_string(), query.to_string())];
    for (key, value) in entities {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        params.push((key.clone(), value));
    }
    params
}

/// GET one configured endpoint per intent.
pub struct HttpExternalApi {
    client: reqwest::Client,
    endpoints: HashMap<Intent, String>,
    api_key: Option<SecretString>,
}

impl HttpExternalApi {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: client(timeout)?,
            endpoints: HashMap::new(),
            api_key: None,
        })
    }

    pub fn with_endpoint(mut self, intent: Intent, url: impl Into<String>) -> Self {
        self.endpoints.insert(intent, url.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<SecretString>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn endpoint(&self, intent: Intent) -> Option<&str> {
        self.endpoints.get(&intent).map(String::as_str)
    }
}

#[async_trait]
impl ExternalApi for HttpExternalApi {
    async fn fetch(
        &self,
        intent: Intent,
        entities: &Entities,
        query: &str,
    ) -> Result<Option<serde_json::Value>> {
        let Some(url) = self.endpoint(intent) else {
            debug!(intent = %intent, "No external endpoint for intent");
            return Ok(None);
        };

        let mut request = self.client.get(url).query(&query_params(entities, query));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose());
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::ExternalApi(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            warn!(intent = %intent, status = %status, "External API error");
            return Err(PipelineError::ExternalApi(format!("{url} returned {status}")));
        }

        let data = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| PipelineError::ExternalApi(format!("invalid JSON from {url}: {e}")))?;
        Ok(Some(data))
    }
}

/// POST `{"text": ...}` to a classifier returning `{intent, confidence}`.
pub struct HttpIntentApi {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    text: &'a str,
}

impl HttpIntentApi {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl IntentApi for HttpIntentApi {
    async fn classify(&self, text: &str) -> Result<ApiClassification> {
        let response = self
            .client
            .post(&self.url)
            .json(&ClassifyRequest { text })
            .send()
            .await
            .map_err(|e| PipelineError::ExternalApi(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::ExternalApi(format!(
                "intent API returned {status}"
            )));
        }

        response
            .json::<ApiClassification>()
            .await
            .map_err(|e| PipelineError::ExternalApi(format!("invalid intent API response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_params_flatten_scalars() {
        let mut entities = Entities::new();
        entities.insert("venue".into(), serde_json::json!("邱德拔"));
        entities.insert("day".into(), serde_json::json!(3));
        entities.insert("tags".into(), serde_json::json!(["a"]));

        let params = query_params(&entities, "开放时间");

        assert_eq!(params[0], ("q".to_string(), "开放时间".to_string()));
        assert!(params.contains(&("venue".to_string(), "邱德拔".to_string())));
        assert!(params.contains(&("day".to_string(), "3".to_string())));
        assert_eq!(params.len(), 3);
    }

    #[tokio::test]
    async fn test_unconfigured_intent_is_none() {
        let api = HttpExternalApi::new()
            .unwrap()
            .with_endpoint(Intent::EventQuery, "http://127.0.0.1:9/events");

        let data = api
            .fetch(Intent::FacilityQuery, &Entities::new(), "几点开门")
            .await
            .unwrap();

        assert_eq!(data, None);
        assert_eq!(api.endpoint(Intent::EventQuery), Some("http://127.0.0.1:9/events"));
    }

    #[test]
    fn test_classification_parses_without_entities() {
        let parsed: ApiClassification =
            serde_json::from_str(r#"{"intent": "course_info", "confidence": 0.82}"#).unwrap();
        assert_eq!(parsed.intent, "course_info");
        assert!(parsed.entities.is_empty());
    }
}
