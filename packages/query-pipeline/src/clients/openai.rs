//! OpenAI-compatible [`LanguageModel`] (DashScope compatible mode by default).

use async_trait::async_trait;
use openai_client::{ChatRequest, Message, OpenAIClient, OpenAIError, DASHSCOPE_BASE_URL};
use std::time::Instant;

use crate::error::{PipelineError, Result};
use crate::security::ApiCredentials;
use crate::traits::model::{CompletionRequest, LanguageModel};

#[derive(Debug, Clone)]
pub struct OpenAiModel {
    client: OpenAIClient,
}

impl OpenAiModel {
    pub fn new(client: OpenAIClient) -> Self {
        Self { client }
    }

    /// Client for the credentials' endpoint, DashScope if none is set.
    pub fn from_credentials(credentials: &ApiCredentials) -> Self {
        let base_url = credentials.base_url.as_deref().unwrap_or(DASHSCOPE_BASE_URL);
        Self::new(OpenAIClient::new(credentials.api_key.expose()).with_base_url(base_url))
    }
}

fn chat_request(request: &CompletionRequest) -> ChatRequest {
    let mut chat = ChatRequest::new(&request.params.model);
    if let Some(system) = &request.system {
        chat = chat.message(Message::system(system));
    }
    chat.message(Message::user(&request.prompt))
        .temperature(request.params.temperature)
        .top_p(request.params.top_p)
        .max_tokens(request.params.max_tokens)
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let start = Instant::now();
        match self.client.chat_completion(chat_request(&request)).await {
            Ok(response) => Ok(response.content),
            Err(OpenAIError::Timeout) => Err(PipelineError::ModelTimeout {
                elapsed_ms: start.elapsed().as_millis() as u64,
            }),
            Err(e) => Err(PipelineError::model(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::config::GenerationParams;

    #[test]
    fn test_chat_request_carries_params() {
        let request = CompletionRequest::new("体测标准", GenerationParams::intent()).with_system("分类器");

        let chat = chat_request(&request);

        assert_eq!(chat.model, "qwen-max");
        assert_eq!(chat.messages, vec![Message::system("分类器"), Message::user("体测标准")]);
        assert_eq!(chat.temperature, Some(0.0));
        assert_eq!(chat.max_tokens, Some(1024));
    }

    #[test]
    fn test_defaults_to_dashscope() {
        let model = OpenAiModel::from_credentials(&ApiCredentials::new("sk-test"));
        assert_eq!(model.client.base_url(), DASHSCOPE_BASE_URL);
    }
}
