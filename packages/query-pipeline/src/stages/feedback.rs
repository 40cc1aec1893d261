//! Feedback stage: ratings, alerts, and guarded answer revision.
//!
//! Every accepted submission is stored under its token. Ratings update
//! running aggregates and may raise an alert. Suggestions
//! start an asynchronous revision, guarded per token by an atomic
//! set-if-absent lock at `feedback:processing:{token}`. A second request
//! while the lock is held is acknowledged as already processing.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::broker::{keys, MessageBroker};
use crate::error::{FeedbackError, FeedbackResult, Result};
use crate::stages::generation::GenerationStage;
use crate::text;
use crate::traits::store::{KeyValueStore, Store, StoreExt};
use crate::types::config::FeedbackConfig;
use crate::types::feedback::{
    FeedbackReceipt, FeedbackRecord, FeedbackState, GenerationRecord, RatingAlert, RatingOutcome,
    RevisionRequest, RevisionStatus,
};
use crate::types::generation::GenerationOutput;

pub struct FeedbackStage {
    store: Arc<dyn Store>,
    broker: MessageBroker,
    generation: Arc<GenerationStage>,
    config: FeedbackConfig,
    tracker: TaskTracker,
}

impl FeedbackStage {
    pub fn new(broker: MessageBroker, generation: Arc<GenerationStage>, config: FeedbackConfig) -> Self {
        Self {
            store: broker.store().clone(),
            broker,
            generation,
            config,
            tracker: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &FeedbackConfig {
        &self.config
    }

    /// Revisions currently running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Accept a rating and/or suggestions for a previously issued token.
    pub async fn submit(&self, feedback: FeedbackRecord) -> FeedbackResult<FeedbackReceipt> {
        self.validate(&feedback)?;

        let token = feedback.feedback_token.clone();
        let record: GenerationRecord = self
            .store
            .get_json(&keys::feedback(&token))
            .await?
            .ok_or_else(|| FeedbackError::UnknownToken {
                token: token.clone(),
            })?;

        self.store_submission(&feedback).await?;

        let rating = match feedback.rating {
            Some(rating) => Some(self.record_rating(&record, rating).await?),
            None => None,
        };

        let suggestions = feedback.suggestion_text().map(str::to_string);
        let revision = match suggestions {
            Some(suggestions) => Some(self.request_revision(&token, feedback, suggestions).await?),
            None => None,
        };

        Ok(FeedbackReceipt {
            feedback_token: token,
            rating,
            revision,
        })
    }

    /// Keep every accepted submission under its own numbered key.
    async fn store_submission(&self, feedback: &FeedbackRecord) -> Result<()> {
        let token = feedback.feedback_token.as_str();
        let n = self
            .store
            .incr_by(&keys::feedback_submissions(token), 1)
            .await?;
        self.store
            .set_json(
                &keys::feedback_submission(token, n),
                feedback,
                Some(self.generation.config().record_ttl()),
            )
            .await?;
        debug!(
            session_id = %feedback.session_id,
            feedback_token = %token,
            submission = n,
            "Feedback stored"
        );
        Ok(())
    }

    /// Every stored submission for a token, oldest first.
    pub async fn submissions(&self, token: &str) -> Result<Vec<FeedbackRecord>> {
        let count = match self.store.get(&keys::feedback_submissions(token)).await? {
            Some(raw) => raw.parse::<i64>().unwrap_or_default(),
            None => 0,
        };
        let mut submissions = Vec::new();
        for n in 1..=count {
            if let Some(feedback) = self
                .store
                .get_json::<FeedbackRecord>(&keys::feedback_submission(token, n))
                .await?
            {
                submissions.push(feedback);
            }
        }
        Ok(submissions)
    }

    fn validate(&self, feedback: &FeedbackRecord) -> FeedbackResult<()> {
        if let Some(rating) = feedback.rating {
            if !(1..=5).contains(&rating) {
                return Err(FeedbackError::RatingOutOfRange(rating));
            }
        }
        if let Some(suggestions) = &feedback.suggestions {
            if text::char_len(suggestions) > self.config.max_suggestion_length {
                return Err(FeedbackError::SuggestionTooLong {
                    max: self.config.max_suggestion_length,
                });
            }
        }
        if feedback.rating.is_none() && feedback.suggestion_text().is_none() {
            return Err(FeedbackError::Empty);
        }
        Ok(())
    }

    /// Count a rating once per token and alert on low scores.
    async fn record_rating(&self, record: &GenerationRecord, rating: u8) -> Result<RatingOutcome> {
        let token = record.token();
        let session_id = record.output.session_id.as_str();

        let first = self
            .store
            .set_if_absent(
                &keys::feedback_rated(token),
                rating.to_string(),
                Some(self.generation.config().record_ttl()),
            )
            .await?;
        if !first {
            warn!(feedback_token = %token, "Duplicate rating ignored");
            return Ok(RatingOutcome::Duplicate);
        }

        let count = self.store.incr_by(keys::RATINGS_COUNT, 1).await?;
        let sum = self.store.incr_by(keys::RATINGS_SUM, rating as i64).await?;
        self.store.incr_by(&keys::session_ratings(session_id), 1).await?;
        let average = if count > 0 { sum as f64 / count as f64 } else { 0.0 };

        info!(
            session_id,
            feedback_token = %token,
            rating,
            ratings_count = count,
            average_rating = average,
            "Rating recorded"
        );

        if rating > self.config.rating_alert_threshold {
            return Ok(RatingOutcome::Recorded { alerted: false });
        }

        let alert = RatingAlert {
            session_id: session_id.to_string(),
            feedback_token: token.to_string(),
            rating,
            threshold: self.config.rating_alert_threshold,
            ratings_count: count,
            average_rating: average,
            raised_at: Utc::now(),
        };
        let receivers = self.broker.publish_alert(&alert).await?;
        warn!(
            session_id,
            feedback_token = %token,
            rating,
            receivers,
            "Low rating alert raised"
        );
        Ok(RatingOutcome::Recorded { alerted: true })
    }

    /// Take the per-token lock and start a background revision.
    async fn request_revision(
        &self,
        token: &str,
        feedback: FeedbackRecord,
        suggestions: String,
    ) -> FeedbackResult<RevisionRequest> {
        let token = token.to_string();
        let lock = keys::feedback_processing(&token);

        let acquired = self
            .store
            .set_if_absent(&lock, Utc::now().to_rfc3339(), Some(self.config.processing_ttl()))
            .await?;
        if !acquired {
            info!(feedback_token = %token, "Revision already in progress");
            return Ok(RevisionRequest::AlreadyProcessing);
        }

        // Load under the lock; an earlier revision may have finished since `submit` read it.
        let mut record = match self
            .store
            .get_json::<GenerationRecord>(&keys::feedback(&token))
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.release(&lock).await;
                return Err(FeedbackError::UnknownToken { token });
            }
            Err(e) => {
                self.release(&lock).await;
                return Err(e.into());
            }
        };

        if !record.transition(FeedbackState::Processing) {
            // The lock expired while the record still said processing.
            warn!(feedback_token = %token, status = ?record.status, "Taking over stale revision");
            record.status = FeedbackState::Processing;
            record.updated_at = Utc::now();
        }
        record.last_feedback = Some(feedback);

        let record_ttl = self.generation.config().record_ttl();
        if let Err(e) = self
            .store
            .set_json(&keys::feedback(&token), &record, Some(record_ttl))
            .await
        {
            self.release(&lock).await;
            return Err(e.into());
        }

        info!(feedback_token = %token, "Revision started");
        let store = self.store.clone();
        let generation = self.generation.clone();
        let revised_ttl = self.config.revised_ttl();
        self.tracker.spawn(async move {
            let outcome = generation.revise(&record, &suggestions).await;
            match outcome {
                Ok(output) => {
                    if let Err(e) = store
                        .set_json(&keys::feedback_revised(&token), &output, Some(revised_ttl))
                        .await
                    {
                        error!(feedback_token = %token, error = %e, "Failed to store revised answer");
                    }
                    record.output = output;
                    record.error = None;
                    record.revision_count += 1;
                    record.transition(FeedbackState::Processed);
                    info!(
                        feedback_token = %token,
                        revision_count = record.revision_count,
                        "Revision complete"
                    );
                }
                Err(e) => {
                    error!(feedback_token = %token, error = %e, "Revision failed");
                    record.error = Some(e.to_string());
                    record.transition(FeedbackState::Failed);
                }
            }

            if let Err(e) = store
                .set_json(&keys::feedback(&token), &record, Some(record_ttl))
                .await
            {
                error!(feedback_token = %token, error = %e, "Failed to update generation record");
            }
            if let Err(e) = store.delete(&keys::feedback_processing(&token)).await {
                error!(feedback_token = %token, error = %e, "Failed to release revision lock");
            }
        });

        Ok(RevisionRequest::Started)
    }

    async fn release(&self, lock: &str) {
        if let Err(e) = self.store.delete(lock).await {
            error!(lock, error = %e, "Failed to release revision lock");
        }
    }

    /// What a client polling `token` would see.
    pub async fn revision(&self, token: &str) -> Result<RevisionStatus> {
        if self.store.exists(&keys::feedback_processing(token)).await? {
            return Ok(RevisionStatus::Processing);
        }
        let Some(record) = self
            .store
            .get_json::<GenerationRecord>(&keys::feedback(token))
            .await?
        else {
            return Ok(RevisionStatus::NotFound);
        };

        Ok(match record.status {
            FeedbackState::Pending => RevisionStatus::NotRequested,
            FeedbackState::Processing => RevisionStatus::Processing,
            FeedbackState::Failed => {
                RevisionStatus::Failed(record.error.unwrap_or_else(|| "revision failed".to_string()))
            }
            FeedbackState::Processed => {
                let revised: Option<GenerationOutput> =
                    self.store.get_json(&keys::feedback_revised(token)).await?;
                RevisionStatus::Revised(revised.unwrap_or(record.output))
            }
        })
    }

    /// Stop accepting new revisions and wait for running ones.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::PromptTemplates;
    use crate::stores::MemoryStore;
    use crate::testing::MockModel;
    use crate::traits::store::{PubSub, Subscription};
    use async_trait::async_trait;
    use crate::types::config::{BrokerConfig, GenerationConfig};
    use crate::types::generation::GenerationInput;
    use crate::types::intent::{Intent, IntentResult};
    use std::time::Duration;

    struct Fixture {
        feedback: FeedbackStage,
        generation: Arc<GenerationStage>,
        broker: MessageBroker,
        store: Arc<MemoryStore>,
    }

    fn fixture(model: MockModel) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let broker = MessageBroker::new(store.clone(), BrokerConfig::default());
        let generation = Arc::new(GenerationStage::new(
            Arc::new(model),
            store.clone(),
            Arc::new(PromptTemplates::default()),
            GenerationConfig::default().with_retry(1, 0),
        ));
        let feedback = FeedbackStage::new(broker.clone(), generation.clone(), FeedbackConfig::default());
        Fixture {
            feedback,
            generation,
            broker,
            store,
        }
    }

    async fn answered(fx: &Fixture) -> GenerationOutput {
        let intent = IntentResult::new("s-1", Intent::FacilityQuery, 0.9);
        fx.generation
            .generate(GenerationInput::without_retrieval(&intent, "几点开门"))
            .await
    }

    /// Memory store whose lock acquisition is slow, widening the window
    /// between reading a record and taking its revision lock.
    struct SlowLockStore {
        inner: MemoryStore,
        lock_delay: Duration,
    }

    #[async_trait]
    impl KeyValueStore for SlowLockStore {
        async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
            self.inner.set(key, value, ttl).await
        }

        async fn set_if_absent(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<bool> {
            tokio::time::sleep(self.lock_delay).await;
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
            self.inner.incr_by(key, delta).await
        }
    }

    #[async_trait]
    impl PubSub for SlowLockStore {
        async fn publish(&self, channel: &str, payload: String) -> Result<usize> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: &str) -> Result<Subscription> {
            self.inner.subscribe(channel).await
        }
    }

    fn model() -> MockModel {
        MockModel::new()
            .with_response("用户意见", r#"{"answer": "修订后的回答"}"#)
            .with_default_response(r#"{"answer": "原回答"}"#)
    }

    #[tokio::test]
    async fn test_rating_updates_aggregates() {
        let fx = fixture(model());
        let output = answered(&fx).await;

        let receipt = fx
            .feedback
            .submit(FeedbackRecord::new("s-1", &output.feedback_token).with_rating(5))
            .await
            .unwrap();

        assert_eq!(receipt.rating, Some(RatingOutcome::Recorded { alerted: false }));
        assert_eq!(receipt.revision, None);
        assert_eq!(fx.store.get(keys::RATINGS_COUNT).await.unwrap().as_deref(), Some("1"));
        assert_eq!(fx.store.get(keys::RATINGS_SUM).await.unwrap().as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_duplicate_rating_not_counted_twice() {
        let fx = fixture(model());
        let output = answered(&fx).await;
        let rating = FeedbackRecord::new("s-1", &output.feedback_token).with_rating(4);

        fx.feedback.submit(rating.clone()).await.unwrap();
        let again = fx.feedback.submit(rating).await.unwrap();

        assert_eq!(again.rating, Some(RatingOutcome::Duplicate));
        assert_eq!(fx.store.get(keys::RATINGS_COUNT).await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_low_rating_publishes_alert() {
        let fx = fixture(model());
        let output = answered(&fx).await;
        let mut alerts = fx.broker.subscribe_alerts().await.unwrap();

        let receipt = fx
            .feedback
            .submit(FeedbackRecord::new("s-1", &output.feedback_token).with_rating(1))
            .await
            .unwrap();

        assert_eq!(receipt.rating, Some(RatingOutcome::Recorded { alerted: true }));
        let alert: RatingAlert = serde_json::from_str(&alerts.recv().await.unwrap()).unwrap();
        assert_eq!(alert.rating, 1);
        assert_eq!(alert.feedback_token, output.feedback_token);
        assert_eq!(alert.average_rating, 1.0);
    }

    #[tokio::test]
    async fn test_validation() {
        let fx = fixture(model());
        let output = answered(&fx).await;
        let token = output.feedback_token.as_str();

        let err = fx
            .feedback
            .submit(FeedbackRecord::new("s-1", token).with_rating(6))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedbackError::RatingOutOfRange(6)));

        let err = fx
            .feedback
            .submit(FeedbackRecord::new("s-1", token).with_suggestions("长".repeat(501)))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedbackError::SuggestionTooLong { max: 500 }));

        let err = fx
            .feedback
            .submit(FeedbackRecord::new("s-1", token).with_suggestions("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedbackError::Empty));

        let err = fx
            .feedback
            .submit(FeedbackRecord::new("s-1", "no-such-token").with_rating(3))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedbackError::UnknownToken { .. }));
    }

    #[tokio::test]
    async fn test_suggestion_revises_answer() {
        let fx = fixture(model());
        let output = answered(&fx).await;
        let token = output.feedback_token.clone();
        assert_eq!(fx.feedback.revision(&token).await.unwrap(), RevisionStatus::NotRequested);

        let receipt = fx
            .feedback
            .submit(FeedbackRecord::new("s-1", &token).with_suggestions("请更详细"))
            .await
            .unwrap();
        assert_eq!(receipt.revision, Some(RevisionRequest::Started));

        fx.feedback.drain().await;

        match fx.feedback.revision(&token).await.unwrap() {
            RevisionStatus::Revised(revised) => {
                assert_eq!(revised.answer, "修订后的回答");
                assert_eq!(revised.feedback_token, token);
            }
            other => panic!("expected revised answer, got {other:?}"),
        }
        let record: GenerationRecord = fx.store.get_json(&keys::feedback(&token)).await.unwrap().unwrap();
        assert_eq!(record.status, FeedbackState::Processed);
        assert_eq!(record.revision_count, 1);
        assert!(!fx.store.exists(&keys::feedback_processing(&token)).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_suggestions_start_one_revision() {
        let fx = fixture(model().with_delay(Duration::from_millis(50)));
        let output = answered(&fx).await;
        let token = output.feedback_token.clone();
        let request = || FeedbackRecord::new("s-1", &token).with_suggestions("请补充预约方式");

        let (a, b) = tokio::join!(fx.feedback.submit(request()), fx.feedback.submit(request()));
        let mut outcomes = vec![a.unwrap().revision.unwrap(), b.unwrap().revision.unwrap()];
        outcomes.sort_by_key(|r| *r == RevisionRequest::AlreadyProcessing);

        assert_eq!(
            outcomes,
            vec![RevisionRequest::Started, RevisionRequest::AlreadyProcessing]
        );
        assert_eq!(fx.feedback.revision(&token).await.unwrap(), RevisionStatus::Processing);

        fx.feedback.drain().await;
        assert!(matches!(
            fx.feedback.revision(&token).await.unwrap(),
            RevisionStatus::Revised(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_revision_releases_lock() {
        let fx = fixture(MockModel::new().with_default_response(r#"{"answer": "原回答"}"#));
        let output = answered(&fx).await;
        let token = output.feedback_token.clone();

        // Make every later call fail.
        let failing = Arc::new(GenerationStage::new(
            Arc::new(MockModel::new().failing()),
            fx.store.clone(),
            Arc::new(PromptTemplates::default()),
            GenerationConfig::default().with_retry(1, 0),
        ));
        let feedback = FeedbackStage::new(fx.broker.clone(), failing, FeedbackConfig::default());

        feedback
            .submit(FeedbackRecord::new("s-1", &token).with_suggestions("再详细一点"))
            .await
            .unwrap();
        feedback.drain().await;

        assert!(matches!(
            feedback.revision(&token).await.unwrap(),
            RevisionStatus::Failed(_)
        ));
        assert!(!fx.store.exists(&keys::feedback_processing(&token)).await.unwrap());

        // A failed token can be revised again.
        let retry = FeedbackStage::new(fx.broker.clone(), fx.generation.clone(), FeedbackConfig::default());
        let receipt = retry
            .submit(FeedbackRecord::new("s-1", &token).with_suggestions("再详细一点"))
            .await
            .unwrap();
        assert_eq!(receipt.revision, Some(RevisionRequest::Started));
        retry.drain().await;
    }

    #[tokio::test]
    async fn test_rating_and_suggestion_together() {
        let fx = fixture(model());
        let output = answered(&fx).await;

        let receipt = fx
            .feedback
            .submit(
                FeedbackRecord::new("s-1", &output.feedback_token)
                    .with_rating(2)
                    .with_suggestions("答非所问"),
            )
            .await
            .unwrap();

        assert_eq!(receipt.rating, Some(RatingOutcome::Recorded { alerted: true }));
        assert_eq!(receipt.revision, Some(RevisionRequest::Started));
        fx.feedback.drain().await;
    }

    #[tokio::test]
    async fn test_rating_only_submission_is_stored() {
        let fx = fixture(model());
        let output = answered(&fx).await;
        let token = output.feedback_token.clone();
        let mut rating = FeedbackRecord::new("s-1", &token).with_rating(3);
        rating
            .context
            .insert("page".to_string(), serde_json::json!("facility"));

        fx.feedback.submit(rating.clone()).await.unwrap();
        let suggestion = FeedbackRecord::new("s-1", &token).with_suggestions("请补充开放时间");
        fx.feedback.submit(suggestion.clone()).await.unwrap();
        fx.feedback.drain().await;

        assert_eq!(fx.feedback.submissions(&token).await.unwrap(), vec![rating, suggestion]);
        assert!(fx.feedback.submissions("no-such-token").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_revision_builds_on_finished_one() {
        let store = Arc::new(SlowLockStore {
            inner: MemoryStore::new(),
            lock_delay: Duration::from_millis(50),
        });
        let model = Arc::new(model().with_delay(Duration::from_millis(10)));
        let broker = MessageBroker::new(store.clone(), BrokerConfig::default());
        let generation = Arc::new(GenerationStage::new(
            model.clone(),
            store.clone(),
            Arc::new(PromptTemplates::default()),
            GenerationConfig::default().with_retry(1, 0),
        ));
        let feedback = FeedbackStage::new(broker, generation.clone(), FeedbackConfig::default());
        let intent = IntentResult::new("s-1", Intent::FacilityQuery, 0.9);
        let output = generation
            .generate(GenerationInput::without_retrieval(&intent, "几点开门"))
            .await;
        let token = output.feedback_token.clone();

        // The first revision finishes while the second waits for the lock.
        let first = feedback
            .submit(FeedbackRecord::new("s-1", &token).with_suggestions("请更详细"))
            .await
            .unwrap();
        let second = feedback
            .submit(FeedbackRecord::new("s-1", &token).with_suggestions("再补充预约方式"))
            .await
            .unwrap();
        feedback.drain().await;

        assert_eq!(first.revision, Some(RevisionRequest::Started));
        assert_eq!(second.revision, Some(RevisionRequest::Started));
        let record: GenerationRecord = store.get_json(&keys::feedback(&token)).await.unwrap().unwrap();
        assert_eq!(record.status, FeedbackState::Processed);
        assert_eq!(record.revision_count, 2);
        assert_eq!(
            record.last_feedback.and_then(|f| f.suggestions).as_deref(),
            Some("再补充预约方式")
        );

        let prompts = model.prompts();
        let last = prompts.last().unwrap();
        assert!(last.contains("再补充预约方式"));
        assert!(last.contains("修订后的回答"));
    }
}
