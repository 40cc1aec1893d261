//! Concrete collaborators over HTTP.

pub mod http_api;
pub mod tavily;

#[cfg(feature = "openai")]
pub mod openai;

pub use http_api::{HttpExternalApi, HttpIntentApi};
pub use tavily::TavilyWebSearcher;

#[cfg(feature = "openai")]
pub use openai::OpenAiModel;
