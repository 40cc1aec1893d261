//! Wiring: builds every stage from one config and a set of collaborators.
//!
//! ```rust,ignore
//! let pipeline = PipelineBuilder::new(PipelineConfig::default())
//!     .with_model(model)
//!     .with_knowledge(Arc::new(kb))
//!     .build()?;
//!
//! let shutdown = CancellationToken::new();
//! let listener = pipeline.start(shutdown.clone()).await?;
//! let answer = pipeline.process(None, "羽毛球场怎么预订").await;
//! ```

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::MessageBroker;
use crate::error::{FeedbackResult, PipelineError, Result};
use crate::knowledge::MemoryKnowledgeBase;
use crate::orchestrator::Orchestrator;
use crate::prompts::PromptTemplates;
use crate::stages::{FeedbackStage, GenerationStage, IntentStage, RetrievalService, RetrievalStage};
use crate::stores::MemoryStore;
use crate::traits::external_api::{ExternalApi, IntentApi};
use crate::traits::knowledge::KnowledgeBase;
use crate::traits::model::LanguageModel;
use crate::traits::searcher::WebSearcher;
use crate::traits::store::Store;
use crate::types::config::PipelineConfig;
use crate::types::feedback::{FeedbackReceipt, FeedbackRecord, RevisionStatus};
use crate::types::generation::GenerationOutput;
use crate::types::intent::IntentRegistry;

#[derive(Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    store: Option<Arc<dyn Store>>,
    intent_model: Option<Arc<dyn LanguageModel>>,
    retrieval_model: Option<Arc<dyn LanguageModel>>,
    generation_model: Option<Arc<dyn LanguageModel>>,
    knowledge: Option<Arc<dyn KnowledgeBase>>,
    external_api: Option<Arc<dyn ExternalApi>>,
    intent_api: Option<Arc<dyn IntentApi>>,
    web: Option<Arc<dyn WebSearcher>>,
    registry: Option<IntentRegistry>,
    templates: Option<PromptTemplates>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use one model service for classification, integration and synthesis.
    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.intent_model = Some(model.clone());
        self.retrieval_model = Some(model.clone());
        self.generation_model = Some(model);
        self
    }

    pub fn with_intent_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.intent_model = Some(model);
        self
    }

    pub fn with_retrieval_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.retrieval_model = Some(model);
        self
    }

    pub fn with_generation_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.generation_model = Some(model);
        self
    }

    pub fn with_knowledge(mut self, knowledge: Arc<dyn KnowledgeBase>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn with_external_api(mut self, api: Arc<dyn ExternalApi>) -> Self {
        self.external_api = Some(api);
        self
    }

    pub fn with_intent_api(mut self, api: Arc<dyn IntentApi>) -> Self {
        self.intent_api = Some(api);
        self
    }

    pub fn with_web_searcher(mut self, web: Arc<dyn WebSearcher>) -> Self {
        self.web = Some(web);
        self
    }

    pub fn with_registry(mut self, registry: IntentRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_templates(mut self, templates: PromptTemplates) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let missing = |role: &str| PipelineError::Config(format!("no {role} model configured"));
        let intent_model = self.intent_model.ok_or_else(|| missing("intent"))?;
        let retrieval_model = self.retrieval_model.ok_or_else(|| missing("retrieval"))?;
        let generation_model = self.generation_model.ok_or_else(|| missing("generation"))?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn Store>);
        let knowledge = self.knowledge.unwrap_or_else(|| {
            warn!("No knowledge base configured, retrieval will rely on other sources");
            Arc::new(MemoryKnowledgeBase::default()) as Arc<dyn KnowledgeBase>
        });

        let config = self.config;
        // Retrieval must answer before the orchestrator stops listening.
        if config.retrieval.overall_timeout() >= config.broker.result_wait() {
            return Err(PipelineError::Config(format!(
                "retrieval overall timeout ({}ms) must be shorter than the result wait ({}ms)",
                config.retrieval.overall_timeout_ms, config.broker.result_wait_ms
            )));
        }
        let broker = MessageBroker::new(store.clone(), config.broker.clone());

        let mut intent = IntentStage::new(
            Arc::new(self.registry.unwrap_or_default()),
            store.clone(),
            intent_model,
            config.intent.clone(),
        );
        if let Some(api) = self.intent_api {
            intent = intent.with_api(api);
        }

        let mut retrieval = RetrievalStage::new(knowledge, retrieval_model, config.retrieval.clone());
        if let Some(api) = self.external_api {
            retrieval = retrieval.with_external_api(api);
        }
        if let Some(web) = self.web {
            retrieval = retrieval.with_web_searcher(web);
        }

        let generation = Arc::new(GenerationStage::new(
            generation_model,
            store,
            Arc::new(self.templates.unwrap_or_default()),
            config.generation.clone(),
        ));

        let orchestrator = Orchestrator::new(Arc::new(intent), generation.clone(), broker.clone())
            .with_web(config.retrieval.web_search_enabled);
        let feedback = FeedbackStage::new(broker.clone(), generation, config.feedback.clone());
        let retrieval = RetrievalService::new(Arc::new(retrieval), broker.clone());

        Ok(Pipeline {
            orchestrator: Arc::new(orchestrator),
            feedback: Arc::new(feedback),
            retrieval: Arc::new(retrieval),
            broker,
        })
    }
}

/// A fully wired pipeline.
#[derive(Clone)]
pub struct Pipeline {
    orchestrator: Arc<Orchestrator>,
    feedback: Arc<FeedbackStage>,
    retrieval: Arc<RetrievalService>,
    broker: MessageBroker,
}

impl Pipeline {
    /// Start the retrieval listener. It is subscribed when this returns.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let handle = self.retrieval.clone().start(shutdown).await?;
        info!("Pipeline started");
        Ok(handle)
    }

    pub async fn process(&self, session_id: Option<&str>, query: &str) -> GenerationOutput {
        self.orchestrator.process(session_id, query).await
    }

    pub async fn submit_feedback(&self, feedback: FeedbackRecord) -> FeedbackResult<FeedbackReceipt> {
        self.feedback.submit(feedback).await
    }

    pub async fn revision(&self, token: &str) -> Result<RevisionStatus> {
        self.feedback.revision(token).await
    }

    pub async fn cached_result(&self, session_id: &str) -> Result<Option<GenerationOutput>> {
        self.orchestrator.cached_result(session_id).await
    }

    /// Wait for background revisions to finish.
    pub async fn drain(&self) {
        self.feedback.drain().await;
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn feedback(&self) -> &Arc<FeedbackStage> {
        &self.feedback
    }

    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }
}
