//! Error types for the chat client.

use thiserror::Error;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, OpenAIError>;

/// Chat client errors.
#[derive(Debug, Error)]
pub enum OpenAIError {
    /// Configuration error (missing API key, invalid settings)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error (connection failed)
    #[error("Network error: {0}")]
    Network(String),

    /// Request exceeded the client timeout
    #[error("Request timed out")]
    Timeout,

    /// Non-2xx response (rate limit, invalid request, quota)
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Response body did not match the expected shape
    #[error("Parse error: {0}")]
    Parse(String),
}

impl OpenAIError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            OpenAIError::Network(_) | OpenAIError::Timeout => true,
            OpenAIError::Api { status, .. } => *status == 429 || *status >= 500,
            OpenAIError::Config(_) | OpenAIError::Parse(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(OpenAIError::Timeout.is_transient());
        assert!(OpenAIError::Api { status: 429, message: String::new() }.is_transient());
        assert!(OpenAIError::Api { status: 503, message: String::new() }.is_transient());
        assert!(!OpenAIError::Api { status: 401, message: String::new() }.is_transient());
        assert!(!OpenAIError::Parse("bad".into()).is_transient());
    }
}
