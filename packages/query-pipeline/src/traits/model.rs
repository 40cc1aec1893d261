//! Language model trait shared by classification, integration and synthesis.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::config::GenerationParams;

/// A single prompt sent to a model service.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Optional system instruction.
    pub system: Option<String>,

    /// User prompt.
    pub prompt: String,

    /// Model name and sampling parameters.
    pub params: GenerationParams,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, params: GenerationParams) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            params,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Opaque text-completion service.
///
/// Implementations wrap a provider (OpenAI-compatible endpoints, local
/// models, mocks) and return the raw completion text. Callers own parsing.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete a prompt, returning the model's text.
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}
