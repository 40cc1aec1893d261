//! Minimal client for OpenAI-compatible chat completion endpoints.
//!
//! Works against OpenAI itself and compatible gateways such as DashScope's
//! compatible mode.
//!
//! # Example
//!
//! ```rust,ignore
//! use openai_client::{ChatRequest, Message, OpenAIClient, DASHSCOPE_BASE_URL};
//!
//! let client = OpenAIClient::new(api_key).with_base_url(DASHSCOPE_BASE_URL);
//!
//! let response = client
//!     .chat_completion(
//!         ChatRequest::new("qwen-max")
//!             .message(Message::system("你是北京大学体育助手"))
//!             .message(Message::user("邱德拔几点开门？"))
//!             .temperature(0.1),
//!     )
//!     .await?;
//! ```

pub mod error;
pub mod types;

pub use error::{OpenAIError, Result};
pub use types::*;

use reqwest::Client;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// OpenAI's public endpoint.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// DashScope's OpenAI-compatible endpoint.
pub const DASHSCOPE_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

/// Chat completion client.
#[derive(Clone)]
pub struct OpenAIClient {
    http_client: Client,
    api_key: String,
    base_url: String,
    timeout: Option<Duration>,
}

impl OpenAIClient {
    /// Create a client for OpenAI's endpoint with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            http_client: Client::new(),
            api_key: api_key.into(),
            base_url: OPENAI_BASE_URL.to_string(),
            timeout: None,
        }
    }

    /// Create from an environment variable holding the key.
    pub fn from_env(var: &str) -> Result<Self> {
        let api_key = std::env::var(var).map_err(|_| OpenAIError::Config(format!("{var} not set")))?;
        if api_key.trim().is_empty() {
            return Err(OpenAIError::Config(format!("{var} is empty")));
        }
        Ok(Self::new(api_key))
    }

    /// Set a custom base URL (DashScope, Azure, proxies).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Bound each request.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Chat completion. Returns the first choice's text.
    pub async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse> {
        let start = std::time::Instant::now();

        let mut builder = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(model = %request.model, error = %e, "Chat request failed");
            if e.is_timeout() {
                OpenAIError::Timeout
            } else {
                OpenAIError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            warn!(model = %request.model, status = %status, error = %message, "Chat API error");
            return Err(OpenAIError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let chat_response: types::ChatResponseRaw = response
            .json()
            .await
            .map_err(|e| OpenAIError::Parse(e.to_string()))?;

        let content = chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| OpenAIError::Parse("response has no choices".into()))?;

        debug!(
            model = %request.model,
            duration_ms = start.elapsed().as_millis(),
            total_tokens = chat_response.usage.as_ref().map(|u| u.total_tokens),
            "Chat completion"
        );

        Ok(ChatResponse {
            content,
            usage: chat_response.usage,
        })
    }
}

impl fmt::Debug for OpenAIClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAIClient")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}
