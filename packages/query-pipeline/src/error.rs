//! Typed errors for the query pipeline.
//!
//! Uses `thiserror` for library errors (not `anyhow`). Stage entry points
//! never return these to their callers; they are produced by collaborators
//! and the store, then logged and folded into degraded results.

use thiserror::Error;

/// Errors produced by collaborators and the store adapter.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Model service unavailable or failed
    #[error("model error: {0}")]
    Model(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Model call exceeded its ceiling
    #[error("model call timed out after {elapsed_ms}ms")]
    ModelTimeout { elapsed_ms: u64 },

    /// A bounded operation exceeded its ceiling
    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout {
        operation: &'static str,
        elapsed_ms: u64,
    },

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A stored value could not be decoded
    #[error("failed to decode value at {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// JSON encoding or parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// External HTTP API failed
    #[error("external API error: {0}")]
    ExternalApi(String),

    /// Web search failed
    #[error("web search error: {0}")]
    WebSearch(String),

    /// Knowledge store lookup failed
    #[error("knowledge store error: {0}")]
    Knowledge(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// No prompt template registered for an intent
    #[error("no prompt template for intent: {intent}")]
    MissingTemplate { intent: String },
}

impl PipelineError {
    /// Wrap any error as a model failure.
    pub fn model(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Model(Box::new(err))
    }

    /// Wrap a plain message as a model failure.
    pub fn model_msg(msg: impl Into<String>) -> Self {
        let msg: String = msg.into();
        Self::Model(msg.into())
    }

    /// Wrap a plain message as a storage failure.
    pub fn storage_msg(msg: impl Into<String>) -> Self {
        let msg: String = msg.into();
        Self::Storage(msg.into())
    }
}

/// Errors returned to callers submitting feedback.
#[derive(Debug, Error)]
pub enum FeedbackError {
    /// Rating outside the 1 to 5 scale
    #[error("rating must be between 1 and 5, got {0}")]
    RatingOutOfRange(u8),

    /// Suggestion text exceeds the configured bound
    #[error("suggestions exceed {max} characters")]
    SuggestionTooLong { max: usize },

    /// Neither rating nor suggestion supplied
    #[error("feedback has neither a rating nor suggestions")]
    Empty,

    /// No generation exists for this token
    #[error("unknown feedback token: {token}")]
    UnknownToken { token: String },

    /// Underlying store failure
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result type alias for feedback submission.
pub type FeedbackResult<T> = std::result::Result<T, FeedbackError>;
