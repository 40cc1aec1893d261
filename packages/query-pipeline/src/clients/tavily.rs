//! Tavily-backed web searcher.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::security::SecretString;
use crate::traits::searcher::WebSearcher;
use crate::types::retrieval::WebHit;

const TAVILY_ENDPOINT: &str = "https://api.tavily.com/search";

pub struct TavilyWebSearcher {
    api_key: SecretString,
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl TavilyWebSearcher {
    pub fn new(api_key: impl Into<SecretString>) -> Self {
        Self {
            api_key: api_key.into(),
            client: reqwest::Client::new(),
            endpoint: TAVILY_ENDPOINT.to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    search_depth: &'static str,
    max_results: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Deserialize)]
struct TavilyResult {
    url: String,
    title: Option<String>,
    content: Option<String>,
    score: Option<f32>,
}

impl From<TavilyResult> for WebHit {
    fn from(r: TavilyResult) -> Self {
        WebHit {
            url: r.url,
            title: r.title,
            snippet: r.content,
            score: r.score,
        }
    }
}

#[async_trait]
impl WebSearcher for TavilyWebSearcher {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<WebHit>> {
        let request = SearchRequest {
            query,
            search_depth: "basic",
            max_results: limit,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key.expose()))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::WebSearch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "Tavily search failed");
            return Err(PipelineError::WebSearch(format!("Tavily API error: {status}")));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::WebSearch(format!("invalid Tavily response: {e}")))?;

        let hits: Vec<WebHit> = body
            .results
            .into_iter()
            .filter(|r| !r.url.is_empty())
            .take(limit)
            .map(WebHit::from)
            .collect();
        debug!(hits = hits.len(), "Tavily search");
        Ok(hits)
    }
}
