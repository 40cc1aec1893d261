//! Retrieval request/result records exchanged over the broker.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::intent::{Entities, Intent, IntentResult};

/// Free-form context map carried alongside requests and results.
pub type Context = BTreeMap<String, serde_json::Value>;

/// Marker placed first in `sources` when web search supplied the context.
pub const WEB_SOURCE_MARKER: &str = "web search";

/// Context keys written by the retrieval stage.
pub mod context_keys {
    pub const USER_QUERY: &str = "user_query";
    pub const KB_DATA: &str = "retrieved_kb_data";
    pub const WEB_DATA: &str = "retrieved_web_data";
    pub const API_DATA: &str = "retrieved_api_data";
    pub const IS_WEB_FALLBACK: &str = "is_web_fallback";
}

/// Request published by the orchestrator, consumed once by the retrieval listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub session_id: String,
    pub intent: Intent,
    #[serde(default)]
    pub entities: Entities,
    pub original_query: String,
    #[serde(default)]
    pub use_web: bool,
    #[serde(default)]
    pub context: Context,
}

impl RetrievalRequest {
    /// Build a request from a classification result.
    pub fn from_intent(intent: &IntentResult, original_query: impl Into<String>) -> Self {
        Self {
            session_id: intent.session_id.clone(),
            intent: intent.intent,
            entities: intent.entities.clone(),
            original_query: original_query.into(),
            use_web: false,
            context: Context::new(),
        }
    }

    pub fn with_web(mut self, use_web: bool) -> Self {
        self.use_web = use_web;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Overall outcome recorded under `data.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalStatus {
    Success,
    Empty,
    Error,
}

impl RetrievalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalStatus::Success => "success",
            RetrievalStatus::Empty => "empty",
            RetrievalStatus::Error => "error",
        }
    }
}

/// Aggregated retrieval output for one session.
///
/// `data` is always present; failures carry `status` and a `message`
/// instead of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub session_id: String,
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub media_assets: Vec<MediaAsset>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub cache_key: String,
    #[serde(default)]
    pub context: Context,
    #[serde(default)]
    pub use_web: bool,
}

impl RetrievalResult {
    /// A result with only a status and message in `data`.
    pub fn with_status(
        session_id: impl Into<String>,
        status: RetrievalStatus,
        message: impl Into<String>,
    ) -> Self {
        let mut data = serde_json::Map::new();
        data.insert("status".into(), status.as_str().into());
        data.insert("message".into(), serde_json::Value::String(message.into()));
        Self {
            session_id: session_id.into(),
            data,
            media_assets: Vec::new(),
            sources: Vec::new(),
            cache_key: String::new(),
            context: Context::new(),
            use_web: false,
        }
    }

    /// The degraded placeholder used when retrieval failed or never answered.
    pub fn degraded(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(session_id, RetrievalStatus::Error, message)
    }

    /// Status recorded in `data`; anything unreadable counts as an error.
    pub fn status(&self) -> RetrievalStatus {
        match self.data.get("status").and_then(|v| v.as_str()) {
            Some("success") => RetrievalStatus::Success,
            Some("empty") => RetrievalStatus::Empty,
            _ => RetrievalStatus::Error,
        }
    }

    /// Whether the web fallback supplied the sources.
    pub fn is_web_fallback(&self) -> bool {
        self.context
            .get(context_keys::IS_WEB_FALLBACK)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Kind of a media reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Link,
}

/// Media reference attached to retrieval results and answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAsset {
    #[serde(rename = "type", default = "default_media_kind")]
    pub kind: MediaKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

fn default_media_kind() -> MediaKind {
    MediaKind::Image
}

impl MediaAsset {
    pub fn image(url: impl Into<String>) -> Self {
        Self {
            kind: MediaKind::Image,
            url: url.into(),
            caption: None,
            source: None,
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Ranked snippet returned by a knowledge store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeSnippet {
    pub content: String,
    pub score: f32,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaAsset>,
}

impl KnowledgeSnippet {
    pub fn new(content: impl Into<String>, score: f32) -> Self {
        Self {
            content: content.into(),
            score,
            source: None,
            media: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_media(mut self, asset: MediaAsset) -> Self {
        self.media.push(asset);
        self
    }
}

/// A web search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebHit {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub score: Option<f32>,
}

impl WebHit {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
            snippet: None,
            score: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_result_carries_error_status() {
        let result = RetrievalResult::degraded("s-1", "retrieval timed out");
        assert_eq!(result.status(), RetrievalStatus::Error);
        assert_eq!(result.data["status"], "error");
        assert!(result.sources.is_empty());
    }

    #[test]
    fn test_missing_status_reads_as_error() {
        let mut result = RetrievalResult::with_status("s", RetrievalStatus::Success, "");
        result.data.remove("status");
        assert_eq!(result.status(), RetrievalStatus::Error);
    }

    #[test]
    fn test_media_asset_type_field() {
        let asset = MediaAsset::image("https://cdn.example.com/a.png").with_caption("邱德拔");
        let json = serde_json::to_value(&asset).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["caption"], "邱德拔");
    }
}
