//! Session-scoped question answering for a campus sports assistant.
//!
//! A query moves through three stages, each writing its output into a shared
//! store and announcing it over pub/sub:
//!
//! 1. **Intent**: safety filter, local keyword rules, cached or concurrent
//!    model/API classification with confidence arbitration.
//! 2. **Retrieval**: a standing listener fans out to the knowledge base, an
//!    optional external API and optional web search under timeouts, then
//!    integrates what arrived.
//! 3. **Generation**: per-intent prompt, bounded retry, structured parse with
//!    raw-text fallback, and a fresh feedback token on every path.
//!
//! Feedback on a token records ratings and can trigger a guarded, asynchronous
//! revision of the answer.
//!
//! # Usage
//!
//! ```rust,ignore
//! use query_pipeline::{PipelineBuilder, PipelineConfig, FeedbackRecord};
//! use query_pipeline::testing::MockModel;
//!
//! let pipeline = PipelineBuilder::new(PipelineConfig::default())
//!     .with_model(Arc::new(MockModel::new().with_default_response("...")))
//!     .build()?;
//! let _listener = pipeline.start(shutdown.clone()).await?;
//!
//! let answer = pipeline.process(None, "羽毛球场怎么预订").await;
//! pipeline
//!     .submit_feedback(FeedbackRecord::new(&answer.session_id, &answer.feedback_token).with_rating(5))
//!     .await?;
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Store, model and collaborator seams
//! - [`types`] - Records exchanged between stages, and configuration
//! - [`stages`] - Intent, retrieval, generation and feedback stages
//! - [`broker`] - Channel names, key layout and typed publish/await
//! - [`stores`] - In-memory store with TTL and broadcast pub/sub
//! - [`clients`] - HTTP collaborators (Tavily, external APIs, OpenAI-compatible models)
//! - [`testing`] - Mock collaborators with call tracking

pub mod broker;
pub mod clients;
pub mod error;
pub mod knowledge;
pub mod orchestrator;
pub mod parse;
pub mod pipeline;
pub mod prompts;
pub mod retry;
pub mod security;
pub mod stages;
pub mod stores;
pub mod testing;
pub mod text;
pub mod traits;
pub mod types;

pub use broker::MessageBroker;
pub use error::{FeedbackError, FeedbackResult, PipelineError, Result};
pub use knowledge::{KnowledgeDocument, MemoryKnowledgeBase};
pub use orchestrator::Orchestrator;
pub use pipeline::{Pipeline, PipelineBuilder};
pub use prompts::PromptTemplates;
pub use stages::{FeedbackStage, GenerationStage, IntentStage, RetrievalService, RetrievalStage};
pub use stores::MemoryStore;
pub use traits::{
    external_api::{ApiClassification, ExternalApi, IntentApi},
    knowledge::KnowledgeBase,
    model::{CompletionRequest, LanguageModel},
    searcher::WebSearcher,
    store::{KeyValueStore, PubSub, Store, StoreExt, Subscription},
};
pub use types::{
    config::{
        BrokerConfig, FeedbackConfig, GenerationConfig, GenerationParams, IntentConfig,
        PipelineConfig, RetrievalConfig,
    },
    feedback::{
        FeedbackReceipt, FeedbackRecord, FeedbackState, GenerationRecord, RatingAlert,
        RatingOutcome, RevisionRequest, RevisionStatus,
    },
    generation::{AnswerStatus, GenerationInput, GenerationOutput},
    intent::{Entities, Intent, IntentDefinition, IntentRegistry, IntentResult},
    retrieval::{
        KnowledgeSnippet, MediaAsset, MediaKind, RetrievalRequest, RetrievalResult,
        RetrievalStatus, WebHit,
    },
};

pub use clients::{HttpExternalApi, HttpIntentApi, TavilyWebSearcher};

#[cfg(feature = "openai")]
pub use clients::OpenAiModel;
