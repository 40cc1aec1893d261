//! Retrieval stage: concurrent fan-out, bounded aggregation, integration.
//!
//! Three sub-tasks run on a `JoinSet`:
//!
//! - knowledge base lookup (always)
//! - external API call (when enabled and configured)
//! - web search (when globally enabled, requested, and the query rewrite succeeds)
//!
//! Each sub-task carries its own timeout and the whole collection loop runs
//! against an overall deadline. Anything still running at the deadline is
//! aborted; its absence degrades the result instead of failing it. The same
//! deadline caps the integration call, so a result is always published
//! within `overall_timeout` of the request being picked up.
//!
//! [`RetrievalService`] is the standing listener that consumes requests from
//! the broker and answers on each session's result channel.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::broker::MessageBroker;
use crate::error::{PipelineError, Result};
use crate::parse;
use crate::prompts;
use crate::text;
use crate::traits::external_api::ExternalApi;
use crate::traits::knowledge::KnowledgeBase;
use crate::traits::model::{CompletionRequest, LanguageModel};
use crate::traits::searcher::WebSearcher;
use crate::types::config::RetrievalConfig;
use crate::types::intent::Intent;
use crate::types::retrieval::{
    context_keys, Context, KnowledgeSnippet, MediaAsset, RetrievalRequest, RetrievalResult,
    RetrievalStatus, WebHit, WEB_SOURCE_MARKER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Knowledge,
    Api,
    Web,
}

impl Source {
    fn as_str(&self) -> &'static str {
        match self {
            Source::Knowledge => "knowledge",
            Source::Api => "api",
            Source::Web => "web",
        }
    }
}

enum Partial {
    Knowledge(Vec<KnowledgeSnippet>),
    Api(Option<serde_json::Value>),
    Web(Vec<WebHit>),
}

/// What the fan-out produced before integration.
#[derive(Debug, Default)]
struct Gathered {
    knowledge: Vec<KnowledgeSnippet>,
    api: Option<serde_json::Value>,
    web: Vec<WebHit>,
    succeeded: usize,
}

impl Gathered {
    fn is_empty(&self) -> bool {
        self.knowledge.is_empty() && self.api.is_none() && self.web.is_empty()
    }
}

async fn within<T>(
    operation: &'static str,
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| PipelineError::Timeout {
            operation,
            elapsed_ms: limit.as_millis() as u64,
        })?
}

pub struct RetrievalStage {
    knowledge: Arc<dyn KnowledgeBase>,
    model: Arc<dyn LanguageModel>,
    api: Option<Arc<dyn ExternalApi>>,
    web: Option<Arc<dyn WebSearcher>>,
    config: RetrievalConfig,
}

impl RetrievalStage {
    pub fn new(
        knowledge: Arc<dyn KnowledgeBase>,
        model: Arc<dyn LanguageModel>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            knowledge,
            model,
            api: None,
            web: None,
            config,
        }
    }

    pub fn with_external_api(mut self, api: Arc<dyn ExternalApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_web_searcher(mut self, web: Arc<dyn WebSearcher>) -> Self {
        self.web = Some(web);
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve and integrate context for one request. Never fails.
    pub async fn retrieve(&self, request: &RetrievalRequest) -> RetrievalResult {
        let start = std::time::Instant::now();
        let cache_key = text::hash(&text::normalize(&request.original_query));

        let mut result = if request.intent.is_unrecognized() {
            debug!(session_id = %request.session_id, "Unrecognized intent, skipping retrieval");
            RetrievalResult::with_status(
                &request.session_id,
                RetrievalStatus::Empty,
                "intent not recognized; nothing to retrieve",
            )
        } else {
            let deadline = Instant::now() + self.config.overall_timeout();
            let gathered = self.gather(request, deadline).await;
            self.assemble(request, gathered, deadline).await
        };

        result.cache_key = cache_key;
        result.use_web = request.use_web;
        for (key, value) in &request.context {
            result.context.entry(key.clone()).or_insert_with(|| value.clone());
        }

        info!(
            session_id = %request.session_id,
            intent = %request.intent,
            status = result.status().as_str(),
            sources = result.sources.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Retrieval finished"
        );
        result
    }

    async fn gather(&self, request: &RetrievalRequest, deadline: Instant) -> Gathered {
        let subtask = self.config.subtask_timeout();
        let mut set: JoinSet<(Source, Result<Partial>)> = JoinSet::new();

        {
            let kb = self.knowledge.clone();
            let query = request.original_query.clone();
            let intent = request.intent;
            let (top_k, min_score) = (self.config.top_k, self.config.min_score);
            set.spawn(async move {
                let res = within("knowledge search", subtask, kb.search(&query, intent, top_k, min_score)).await;
                (Source::Knowledge, res.map(Partial::Knowledge))
            });
        }

        match (&self.api, self.config.external_api_enabled) {
            (Some(api), true) => {
                let api = api.clone();
                let query = request.original_query.clone();
                let intent = request.intent;
                let entities = request.entities.clone();
                set.spawn(async move {
                    let res = within("external api", subtask, api.fetch(intent, &entities, &query)).await;
                    (Source::Api, res.map(Partial::Api))
                });
            }
            _ => debug!(session_id = %request.session_id, "External API disabled"),
        }

        if self.config.web_search_enabled && request.use_web {
            if let Some(web) = &self.web {
                let web = web.clone();
                let model = self.model.clone();
                let params = self.config.model.clone();
                let query = request.original_query.clone();
                let limit = self.config.web_result_limit;
                set.spawn(async move {
                    let res = async {
                        let rewritten = rewrite_query(model.as_ref(), &query, params, subtask).await?;
                        within("web search", subtask, web.search(&rewritten, limit)).await
                    }
                    .await;
                    (Source::Web, res.map(Partial::Web))
                });
            }
        }

        let mut gathered = Gathered::default();

        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((source, Ok(partial))))) => {
                    gathered.succeeded += 1;
                    match partial {
                        Partial::Knowledge(snippets) => gathered.knowledge = snippets,
                        Partial::Api(data) => gathered.api = data,
                        Partial::Web(hits) => gathered.web = hits,
                    }
                    debug!(session_id = %request.session_id, source = source.as_str(), "Sub-task completed");
                }
                Ok(Some(Ok((source, Err(e))))) => {
                    warn!(
                        session_id = %request.session_id,
                        source = source.as_str(),
                        error = %e,
                        "Retrieval sub-task failed"
                    );
                }
                Ok(Some(Err(join_err))) => {
                    error!(session_id = %request.session_id, error = %join_err, "Retrieval sub-task panicked");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        session_id = %request.session_id,
                        abandoned = set.len(),
                        "Retrieval deadline reached, abandoning sub-tasks"
                    );
                    set.abort_all();
                    break;
                }
            }
        }

        gathered
    }

    async fn assemble(
        &self,
        request: &RetrievalRequest,
        gathered: Gathered,
        deadline: Instant,
    ) -> RetrievalResult {
        let session_id = request.session_id.as_str();

        if gathered.succeeded == 0 {
            return RetrievalResult::degraded(session_id, "all retrieval sources failed or timed out");
        }

        let mut context = Context::new();
        context.insert(
            context_keys::USER_QUERY.into(),
            request.original_query.clone().into(),
        );

        if gathered.is_empty() {
            let mut result = RetrievalResult::with_status(
                session_id,
                RetrievalStatus::Empty,
                "no relevant information found",
            );
            context.insert(context_keys::IS_WEB_FALLBACK.into(), false.into());
            result.context = context;
            return result;
        }

        let is_web_fallback = gathered.knowledge.is_empty() && !gathered.web.is_empty();
        let sources = select_sources(request.intent, &gathered.knowledge, &gathered.web);
        let media_assets = collect_media(&gathered.knowledge, gathered.api.as_ref());

        let kb_text = gathered
            .knowledge
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>();
        let web_text = gathered
            .web
            .iter()
            .map(|h| {
                format!(
                    "{} ({}): {}",
                    h.title.as_deref().unwrap_or_default(),
                    h.url,
                    h.snippet.as_deref().unwrap_or_default()
                )
            })
            .collect::<Vec<_>>();

        context.insert(context_keys::KB_DATA.into(), serde_json::json!(kb_text));
        context.insert(context_keys::WEB_DATA.into(), serde_json::json!(web_text));
        context.insert(
            context_keys::API_DATA.into(),
            gathered.api.clone().unwrap_or(serde_json::Value::Null),
        );
        context.insert(context_keys::IS_WEB_FALLBACK.into(), is_web_fallback.into());

        let mut data = self
            .integrate(request, &kb_text, gathered.api.as_ref(), &web_text, deadline)
            .await;
        data.insert("status".into(), RetrievalStatus::Success.as_str().into());

        RetrievalResult {
            session_id: session_id.to_string(),
            data,
            media_assets,
            sources,
            cache_key: String::new(),
            context,
            use_web: request.use_web,
        }
    }

    /// Merge partial results through one synthesis call.
    ///
    /// Falls back to the raw material if the model fails or runs past
    /// `deadline`, and to `{"content": raw}` if its output is not JSON.
    async fn integrate(
        &self,
        request: &RetrievalRequest,
        kb_text: &[&str],
        api: Option<&serde_json::Value>,
        web_text: &[String],
        deadline: Instant,
    ) -> serde_json::Map<String, serde_json::Value> {
        let none = "（无）".to_string();
        let join_or_none = |items: Vec<String>| {
            if items.is_empty() {
                none.clone()
            } else {
                items.join("\n")
            }
        };
        let kb_data = join_or_none(kb_text.iter().map(|s| s.to_string()).collect());
        let web_data = join_or_none(web_text.to_vec());
        let api_data = api
            .map(|v| serde_json::to_string_pretty(v).unwrap_or_default())
            .unwrap_or_else(|| none.clone());

        let prompt = prompts::render(
            prompts::INTEGRATION_PROMPT,
            &[
                ("query", request.original_query.as_str()),
                ("intent", request.intent.as_str()),
                ("kb_data", kb_data.as_str()),
                ("api_data", api_data.as_str()),
                ("web_data", web_data.as_str()),
            ],
        );

        let call = self
            .model
            .complete(CompletionRequest::new(prompt, self.config.model.clone()));
        let limit = deadline.min(Instant::now() + self.config.integration_timeout());
        match tokio::time::timeout_at(limit, call).await {
            Ok(Ok(raw)) => parse::extract_object(&raw).unwrap_or_else(|| {
                debug!(session_id = %request.session_id, "Integration output was not JSON");
                let mut map = serde_json::Map::new();
                map.insert("content".into(), raw.into());
                map
            }),
            Ok(Err(e)) => {
                warn!(session_id = %request.session_id, error = %e, "Integration call failed, using raw material");
                raw_material(&kb_data, api, &web_data)
            }
            Err(_) => {
                warn!(session_id = %request.session_id, "Integration call timed out, using raw material");
                raw_material(&kb_data, api, &web_data)
            }
        }
    }
}

fn raw_material(
    kb_data: &str,
    api: Option<&serde_json::Value>,
    web_data: &str,
) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    map.insert("content".into(), kb_data.into());
    if let Some(api) = api {
        map.insert("api_data".into(), api.clone());
    }
    map.insert("web_content".into(), web_data.into());
    map.insert("integrated".into(), false.into());
    map
}

/// Source precedence: knowledge base > web > none.
fn select_sources(intent: Intent, knowledge: &[KnowledgeSnippet], web: &[WebHit]) -> Vec<String> {
    if !knowledge.is_empty() {
        let mut seen = BTreeSet::new();
        return knowledge
            .iter()
            .map(|s| {
                s.source
                    .clone()
                    .unwrap_or_else(|| intent.default_source().to_string())
            })
            .filter(|s| seen.insert(s.clone()))
            .collect();
    }
    if !web.is_empty() {
        let mut sources = vec![WEB_SOURCE_MARKER.to_string()];
        sources.extend(web.iter().map(|h| h.url.clone()));
        return sources;
    }
    Vec::new()
}

fn collect_media(knowledge: &[KnowledgeSnippet], api: Option<&serde_json::Value>) -> Vec<MediaAsset> {
    let mut seen = BTreeSet::new();
    let mut assets: Vec<MediaAsset> = knowledge.iter().flat_map(|s| s.media.clone()).collect();

    if let Some(api) = api {
        if let Some(url) = api.get("image_url").and_then(|v| v.as_str()) {
            assets.push(MediaAsset::image(url).with_source("external api"));
        }
        if let Some(images) = api.get("images").and_then(|v| v.as_array()) {
            assets.extend(
                images
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|url| MediaAsset::image(url).with_source("external api")),
            );
        }
    }

    assets.retain(|a| seen.insert(a.url.clone()));
    assets
}

async fn rewrite_query(
    model: &dyn LanguageModel,
    query: &str,
    params: crate::types::config::GenerationParams,
    limit: Duration,
) -> Result<String> {
    let prompt = prompts::render(prompts::SEARCH_REWRITE_PROMPT, &[("query", query)]);
    let raw = within("query rewrite", limit, model.complete(CompletionRequest::new(prompt, params))).await?;
    let rewritten = raw.trim().trim_matches('"').trim().to_string();
    if rewritten.is_empty() {
        return Err(PipelineError::WebSearch("query rewrite returned nothing".into()));
    }
    Ok(rewritten)
}

/// Standing listener on the request channel.
///
/// Each request is handled on its own task, bounded by a semaphore, and
/// answered on the session's result channel.
pub struct RetrievalService {
    stage: Arc<RetrievalStage>,
    broker: MessageBroker,
    concurrency: usize,
}

impl RetrievalService {
    pub fn new(stage: Arc<RetrievalStage>, broker: MessageBroker) -> Self {
        let concurrency = stage.config().listener_concurrency.max(1);
        Self {
            stage,
            broker,
            concurrency,
        }
    }

    /// Handle one request and publish its result.
    pub async fn handle(&self, request: RetrievalRequest) -> Result<usize> {
        let result = self.stage.retrieve(&request).await;
        self.broker.publish_retrieval_result(&result).await
    }

    /// Subscribe to the request channel and process until `shutdown` fires.
    ///
    /// The subscription is in place when this returns, so requests published
    /// afterwards are never missed. The returned handle resolves once
    /// in-flight requests have drained.
    pub async fn start(self: Arc<Self>, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
        let mut requests = self.broker.subscribe_retrieval_requests().await?;
        info!(
            channel = requests.channel(),
            concurrency = self.concurrency,
            "Retrieval listener started"
        );

        let handle = tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(self.concurrency));
            let tracker = TaskTracker::new();

            loop {
                let raw = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = requests.recv() => match msg {
                        Some(raw) => raw,
                        None => break,
                    },
                };

                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let service = self.clone();
                tracker.spawn(async move {
                    let _permit = permit;
                    service.dispatch(raw).await;
                });
            }

            tracker.close();
            tracker.wait().await;
            info!("Retrieval listener stopped");
        });

        Ok(handle)
    }

    async fn dispatch(&self, raw: String) {
        match serde_json::from_str::<RetrievalRequest>(&raw) {
            Ok(request) => {
                let session_id = request.session_id.clone();
                match self.handle(request).await {
                    Ok(0) => warn!(session_id = %session_id, "Nobody awaiting retrieval result"),
                    Ok(_) => {}
                    Err(e) => error!(session_id = %session_id, error = %e, "Failed to publish retrieval result"),
                }
            }
            Err(e) => {
                // Answer the session if we can still find it, so it does not wait out its timeout.
                let session_id = serde_json::from_str::<serde_json::Value>(&raw)
                    .ok()
                    .and_then(|v| v.get("session_id").and_then(|s| s.as_str()).map(String::from));
                warn!(error = %e, session_id = ?session_id, "Malformed retrieval request");
                if let Some(session_id) = session_id {
                    let result = RetrievalResult::degraded(&session_id, "malformed retrieval request");
                    if let Err(e) = self.broker.publish_retrieval_result(&result).await {
                        error!(session_id = %session_id, error = %e, "Failed to publish degraded result");
                    }
                }
            }
        }
    }
}
