//! Generation stage: answer synthesis and feedback-token minting.
//!
//! Every call to [`GenerationStage::generate`] mints a fresh token and
//! stores a [`GenerationRecord`] under `feedback:{token}`, whichever path
//! produced the answer. The token is the only handle for later revision.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::keys;
use crate::error::{PipelineError, Result};
use crate::parse;
use crate::prompts::{PromptTemplates, ANSWER_SYSTEM_PROMPT};
use crate::retry::RetryPolicy;
use crate::traits::model::{CompletionRequest, LanguageModel};
use crate::traits::store::{Store, StoreExt};
use crate::types::config::GenerationConfig;
use crate::types::feedback::GenerationRecord;
use crate::types::generation::{AnswerStatus, GenerationInput, GenerationOutput};
use crate::types::retrieval::MediaAsset;

/// Fields parsed out of a model answer.
#[derive(Debug, Default)]
struct Synthesized {
    answer: String,
    media: Vec<MediaAsset>,
    sources: Vec<String>,
    related_queries: Vec<String>,
}

impl Synthesized {
    /// Parse structured output, keeping the raw text as the answer otherwise.
    fn parse(raw: &str) -> Self {
        let Some(map) = parse::extract_object(raw) else {
            return Self {
                answer: raw.trim().to_string(),
                ..Default::default()
            };
        };
        let Some(answer) = map.get("answer").and_then(|v| v.as_str()) else {
            return Self {
                answer: raw.trim().to_string(),
                ..Default::default()
            };
        };

        let media = map
            .get("media")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value::<MediaAsset>(item.clone()).ok())
                    .filter(|asset| !asset.url.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            answer: answer.to_string(),
            media,
            sources: parse::string_list(&map, "sources"),
            related_queries: parse::string_list(&map, "related_queries"),
        }
    }
}

pub struct GenerationStage {
    model: Arc<dyn LanguageModel>,
    store: Arc<dyn Store>,
    templates: Arc<PromptTemplates>,
    config: GenerationConfig,
    retry: RetryPolicy,
}

impl GenerationStage {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        store: Arc<dyn Store>,
        templates: Arc<PromptTemplates>,
        config: GenerationConfig,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry_attempts, config.retry_delay());
        Self {
            model,
            store,
            templates,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Produce the final answer for a session. Never fails.
    pub async fn generate(&self, input: GenerationInput) -> GenerationOutput {
        let start = Instant::now();
        let token = Uuid::new_v4().to_string();

        let (output, failure) = self.answer(&input, token).await;

        let record = GenerationRecord::new(input, output.clone(), failure);
        if let Err(e) = self
            .store
            .set_json(
                &keys::feedback(record.token()),
                &record,
                Some(self.config.record_ttl()),
            )
            .await
        {
            error!(
                session_id = %output.session_id,
                feedback_token = %output.feedback_token,
                error = %e,
                "Failed to store generation record"
            );
        }

        info!(
            session_id = %output.session_id,
            feedback_token = %output.feedback_token,
            status = ?output.status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Generation finished"
        );
        output
    }

    async fn answer(
        &self,
        input: &GenerationInput,
        token: String,
    ) -> (GenerationOutput, Option<String>) {
        let fixed = |answer: &str, status| GenerationOutput {
            session_id: input.session_id.clone(),
            answer: answer.to_string(),
            media: Vec::new(),
            feedback_token: token.clone(),
            sources: input.sources.clone(),
            related_queries: Vec::new(),
            status,
        };

        if let Some(prompt) = &input.clarification_prompt {
            debug!(session_id = %input.session_id, "Returning clarification prompt");
            return (fixed(prompt, AnswerStatus::Clarification), None);
        }

        if input.intent.is_unrecognized() {
            debug!(session_id = %input.session_id, "Unrecognized intent, using fixed answer");
            return (fixed(&self.config.unrecognized_answer, AnswerStatus::Fallback), None);
        }

        let Some(prompt) = self.templates.render_answer(input) else {
            let e = PipelineError::MissingTemplate {
                intent: input.intent.to_string(),
            };
            error!(session_id = %input.session_id, error = %e, "Cannot generate answer");
            return (
                fixed(&self.config.unconfigured_answer, AnswerStatus::Unconfigured),
                Some(e.to_string()),
            );
        };

        match self.synthesize(&input.session_id, prompt).await {
            Ok(parsed) => {
                let sources = if input.sources.is_empty() {
                    parsed.sources
                } else {
                    input.sources.clone()
                };
                let media = if input.intent.is_media_capable() {
                    merge_media(&input.media_assets, parsed.media)
                } else {
                    Vec::new()
                };
                let output = GenerationOutput {
                    session_id: input.session_id.clone(),
                    answer: parsed.answer,
                    media,
                    feedback_token: token.clone(),
                    sources,
                    related_queries: parsed.related_queries,
                    status: AnswerStatus::Answered,
                };
                (output, None)
            }
            Err(e) => {
                error!(session_id = %input.session_id, error = %e, "Answer synthesis failed");
                (
                    fixed(&self.config.failure_answer, AnswerStatus::Failed),
                    Some(e.to_string()),
                )
            }
        }
    }

    /// Regenerate an answer from user suggestions, keeping its token.
    pub async fn revise(&self, record: &GenerationRecord, suggestions: &str) -> Result<GenerationOutput> {
        let input = &record.input;
        let prompt = self
            .templates
            .render_revision(input, &record.output.answer, suggestions);

        let parsed = self.synthesize(&input.session_id, prompt).await?;

        let sources = if record.output.sources.is_empty() {
            parsed.sources
        } else {
            record.output.sources.clone()
        };
        let media = if input.intent.is_media_capable() {
            merge_media(&record.output.media, parsed.media)
        } else {
            Vec::new()
        };

        Ok(GenerationOutput {
            session_id: record.output.session_id.clone(),
            answer: parsed.answer,
            media,
            feedback_token: record.output.feedback_token.clone(),
            sources,
            related_queries: parsed.related_queries,
            status: AnswerStatus::Answered,
        })
    }

    async fn synthesize(&self, session_id: &str, prompt: String) -> Result<Synthesized> {
        let limit = self.config.model_timeout();
        let raw = self
            .retry
            .run("answer synthesis", |attempt| {
                let request = CompletionRequest::new(prompt.clone(), self.config.model.clone())
                    .with_system(ANSWER_SYSTEM_PROMPT);
                async move {
                    debug!(session_id, attempt, "Calling synthesis model");
                    let raw = tokio::time::timeout(limit, self.model.complete(request))
                        .await
                        .map_err(|_| PipelineError::ModelTimeout {
                            elapsed_ms: limit.as_millis() as u64,
                        })??;
                    if raw.trim().is_empty() {
                        return Err(PipelineError::model_msg("empty model response"));
                    }
                    Ok(raw)
                }
            })
            .await?;

        let parsed = Synthesized::parse(&raw);
        if parsed.sources.is_empty() && parsed.related_queries.is_empty() && parsed.media.is_empty() {
            warn!(session_id, "Model answer carried no structured fields");
        }
        Ok(parsed)
    }
}

fn merge_media(base: &[MediaAsset], extra: Vec<MediaAsset>) -> Vec<MediaAsset> {
    let mut seen = BTreeSet::new();
    base.iter()
        .cloned()
        .chain(extra)
        .filter(|asset| seen.insert(asset.url.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryStore;
    use crate::testing::MockModel;
    use crate::types::feedback::FeedbackState;
    use crate::types::intent::{Intent, IntentResult};
    use crate::types::retrieval::{RetrievalResult, RetrievalStatus};
    use std::time::Duration;

    fn stage(model: Arc<MockModel>, templates: PromptTemplates) -> (GenerationStage, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let stage = GenerationStage::new(
            model,
            store.clone(),
            Arc::new(templates),
            GenerationConfig::default().with_retry(3, 10),
        );
        (stage, store)
    }

    fn input(intent: Intent, query: &str) -> GenerationInput {
        let intent = IntentResult::new("s-1", intent, 0.9);
        let mut retrieval = RetrievalResult::with_status("s-1", RetrievalStatus::Success, "");
        retrieval.sources = vec!["PKU Sports Facilities Database".into()];
        retrieval.media_assets = vec![MediaAsset::image("https://cdn.example.com/qdb.jpg")];
        GenerationInput::from_stages(&intent, query, &retrieval)
    }

    async fn stored(store: &MemoryStore, token: &str) -> GenerationRecord {
        store.get_json(&keys::feedback(token)).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_structured_answer() {
        let model = Arc::new(MockModel::new().with_default_response(
            r#"{"answer": "在智慧场馆小程序预约", "media": [{"type": "image", "url": "https://cdn.example.com/map.png"}], "related_queries": ["几点开门？"]}"#,
        ));
        let (stage, store) = stage(model, PromptTemplates::default());

        let output = stage.generate(input(Intent::FacilityQuery, "羽毛球场怎么预订")).await;

        assert_eq!(output.answer, "在智慧场馆小程序预约");
        assert_eq!(output.status, AnswerStatus::Answered);
        assert_eq!(output.sources, vec!["PKU Sports Facilities Database"]);
        assert_eq!(output.related_queries, vec!["几点开门？"]);
        assert_eq!(output.media.len(), 2);
        assert!(Uuid::parse_str(&output.feedback_token).is_ok());

        let record = stored(&store, &output.feedback_token).await;
        assert_eq!(record.status, FeedbackState::Pending);
        assert_eq!(record.output, output);
    }

    #[tokio::test]
    async fn test_raw_text_kept_verbatim() {
        let model = Arc::new(MockModel::new().with_default_response("周末 8 点开门。"));
        let (stage, _) = stage(model, PromptTemplates::default());

        let output = stage.generate(input(Intent::CourseInfo, "游泳课几点")).await;

        assert_eq!(output.answer, "周末 8 点开门。");
        assert!(output.media.is_empty(), "course info is not media-capable");
    }

    #[tokio::test]
    async fn test_unrecognized_skips_model() {
        let model = Arc::new(MockModel::new().with_default_response("x"));
        let (stage, store) = stage(model.clone(), PromptTemplates::default());

        let output = stage.generate(input(Intent::Unrecognized, "明天会下雨吗")).await;

        assert_eq!(output.status, AnswerStatus::Fallback);
        assert_eq!(output.answer, GenerationConfig::default().unrecognized_answer);
        assert_eq!(model.call_count(), 0);
        assert!(stored(&store, &output.feedback_token).await.error.is_none());
    }

    #[tokio::test]
    async fn test_missing_template_is_graceful() {
        let model = Arc::new(MockModel::new().with_default_response("x"));
        let (stage, store) = stage(model.clone(), PromptTemplates::default().without(Intent::CourseInfo));

        let output = stage.generate(input(Intent::CourseInfo, "游泳课在哪上")).await;

        assert_eq!(output.status, AnswerStatus::Unconfigured);
        assert!(output.is_degraded());
        assert_eq!(model.call_count(), 0);
        let record = stored(&store, &output.feedback_token).await;
        assert!(record.error.unwrap().contains("course_info"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let model = Arc::new(
            MockModel::new()
                .with_default_response(r#"{"answer": "好的"}"#)
                .failing_times(2),
        );
        let (stage, _) = stage(model.clone(), PromptTemplates::default());

        let output = stage.generate(input(Intent::HealthAdvice, "怎么减肥")).await;

        assert_eq!(output.answer, "好的");
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_still_mint_token() {
        let model = Arc::new(MockModel::new().failing());
        let (stage, store) = stage(model.clone(), PromptTemplates::default());

        let output = stage.generate(input(Intent::EventQuery, "新生杯报名")).await;

        assert_eq!(output.status, AnswerStatus::Failed);
        assert_eq!(model.call_count(), 3);
        let record = stored(&store, &output.feedback_token).await;
        assert!(record.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_failure() {
        let model = Arc::new(
            MockModel::new()
                .with_default_response(r#"{"answer": "迟到的回答"}"#)
                .with_delay(Duration::from_secs(120)),
        );
        let (stage, _) = stage(model.clone(), PromptTemplates::default());

        let output = stage.generate(input(Intent::FacilityQuery, "几点开门")).await;

        assert_eq!(output.status, AnswerStatus::Failed);
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn test_tokens_are_unique() {
        let model = Arc::new(MockModel::new().with_default_response("ok"));
        let (stage, _) = stage(model, PromptTemplates::default());

        let a = stage.generate(input(Intent::FacilityQuery, "几点开门")).await;
        let b = stage.generate(input(Intent::FacilityQuery, "几点开门")).await;

        assert_ne!(a.feedback_token, b.feedback_token);
    }

    #[tokio::test]
    async fn test_revise_keeps_token() {
        let model = Arc::new(
            MockModel::new()
                .with_response("用户意见", r#"{"answer": "更详细的回答"}"#)
                .with_default_response(r#"{"answer": "简短回答"}"#),
        );
        let (stage, store) = stage(model, PromptTemplates::default());
        let output = stage.generate(input(Intent::FacilityQuery, "几点开门")).await;
        let record = stored(&store, &output.feedback_token).await;

        let revised = stage.revise(&record, "请说得更详细").await.unwrap();

        assert_eq!(revised.answer, "更详细的回答");
        assert_eq!(revised.feedback_token, output.feedback_token);
        assert_eq!(revised.sources, output.sources);
    }
}
