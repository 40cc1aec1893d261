//! End-to-end sessions through the broker with mock collaborators.

use std::sync::Arc;
use std::time::Duration;

use query_pipeline::broker::keys;
use query_pipeline::testing::{MockExternalApi, MockKnowledgeBase, MockModel, MockWebSearcher};
use query_pipeline::{
    AnswerStatus, BrokerConfig, FeedbackRecord, GenerationOutput, Intent, IntentResult, KeyValueStore,
    KnowledgeSnippet, MediaAsset, MemoryStore, Pipeline, PipelineBuilder, PipelineConfig,
    RatingAlert, RatingOutcome, RetrievalConfig, RetrievalRequest, RetrievalResult,
    RetrievalStage, RetrievalStatus, RevisionRequest, RevisionStatus, StoreExt,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const INTEGRATED: &str = r#"{"content": "邱德拔体育馆羽毛球场可在智慧场馆小程序提前三天预约", "key_points": ["提前三天"]}"#;
const ANSWER: &str = r#"{"answer": "您可以在智慧场馆小程序提前三天预约邱德拔体育馆羽毛球场。", "related_queries": ["羽毛球场几点开门？"]}"#;

fn knowledge() -> Arc<MockKnowledgeBase> {
    Arc::new(
        MockKnowledgeBase::new().with_intent_snippet(
            Intent::FacilityQuery,
            KnowledgeSnippet::new("邱德拔体育馆羽毛球场需通过智慧场馆预约，可提前三天", 0.9)
                .with_media(MediaAsset::image("https://cdn.example.com/qdb-badminton.jpg")),
        ),
    )
}

fn model() -> MockModel {
    MockModel::new()
        .with_response("请整合", INTEGRATED)
        .with_response("用户意见", r#"{"answer": "修订：请在智慧场馆小程序选择邱德拔体育馆，提前三天预约。"}"#)
        .with_default_response(ANSWER)
}

struct Harness {
    pipeline: Pipeline,
    model: Arc<MockModel>,
    shutdown: CancellationToken,
    listener: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn start(model: MockModel) -> Self {
        let model = Arc::new(model);
        let pipeline = PipelineBuilder::new(PipelineConfig::default())
            .with_model(model.clone())
            .with_knowledge(knowledge())
            .build()
            .unwrap();
        let shutdown = CancellationToken::new();
        let listener = pipeline.start(shutdown.clone()).await.unwrap();
        Self {
            pipeline,
            model,
            shutdown,
            listener,
        }
    }

    async fn stop(self) {
        self.pipeline.drain().await;
        self.shutdown.cancel();
        self.listener.await.unwrap();
    }
}

#[tokio::test]
async fn facility_query_answers_with_sources_and_token() {
    let harness = Harness::start(model()).await;

    let output = harness.pipeline.process(Some("sess-booking"), "羽毛球场怎么预订").await;

    let intent = harness
        .pipeline
        .broker()
        .get_intent("sess-booking")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(intent.intent, Intent::FacilityQuery);
    assert!((intent.confidence - 0.9).abs() < f64::EPSILON);

    assert_eq!(output.status, AnswerStatus::Answered);
    assert!(!output.answer.is_empty());
    assert!(!output.sources.is_empty());
    assert_eq!(output.media[0].url, "https://cdn.example.com/qdb-badminton.jpg");
    assert!(Uuid::parse_str(&output.feedback_token).is_ok());

    // Local rule: only integration and synthesis reached the model.
    let prompts = harness.model.prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].contains("请整合"));

    let cached = harness.pipeline.cached_result("sess-booking").await.unwrap();
    assert_eq!(cached, Some(output));

    harness.stop().await;
}

#[tokio::test]
async fn low_rating_raises_alert_and_updates_aggregates() {
    let harness = Harness::start(model()).await;
    let mut alerts = harness.pipeline.broker().subscribe_alerts().await.unwrap();
    let output = harness.pipeline.process(Some("sess-rating"), "羽毛球场怎么预订").await;
    let store = harness.pipeline.broker().store().clone();

    let receipt = harness
        .pipeline
        .submit_feedback(FeedbackRecord::new("sess-rating", &output.feedback_token).with_rating(1))
        .await
        .unwrap();

    assert_eq!(receipt.rating, Some(RatingOutcome::Recorded { alerted: true }));
    assert_eq!(receipt.revision, None);
    assert_eq!(store.get(keys::RATINGS_COUNT).await.unwrap().as_deref(), Some("1"));
    assert_eq!(store.get(keys::RATINGS_SUM).await.unwrap().as_deref(), Some("1"));

    let alert: RatingAlert = serde_json::from_str(
        &alerts
            .recv_timeout(Duration::from_secs(1))
            .await
            .expect("alert published"),
    )
    .unwrap();
    assert_eq!(alert.session_id, "sess-rating");
    assert_eq!(alert.rating, 1);
    assert_eq!(alert.threshold, 2);

    // A good rating on another answer moves the average but raises nothing.
    let other = harness.pipeline.process(Some("sess-rating-2"), "羽毛球场怎么预订").await;
    let receipt = harness
        .pipeline
        .submit_feedback(FeedbackRecord::new("sess-rating-2", &other.feedback_token).with_rating(5))
        .await
        .unwrap();
    assert_eq!(receipt.rating, Some(RatingOutcome::Recorded { alerted: false }));
    assert_eq!(store.get(keys::RATINGS_SUM).await.unwrap().as_deref(), Some("6"));
    assert!(alerts.recv_timeout(Duration::from_millis(50)).await.is_none());

    harness.stop().await;
}

#[tokio::test]
async fn concurrent_suggestions_revise_once() {
    let harness = Harness::start(model().with_delay(Duration::from_millis(30))).await;
    let output = harness.pipeline.process(Some("sess-revise"), "羽毛球场怎么预订").await;
    let token = output.feedback_token.clone();
    let calls_before = harness.model.call_count();

    let suggestion = || FeedbackRecord::new("sess-revise", &token).with_suggestions("请说明具体的预约步骤");
    let (first, second) = tokio::join!(
        harness.pipeline.submit_feedback(suggestion()),
        harness.pipeline.submit_feedback(suggestion()),
    );
    let mut outcomes = vec![
        first.unwrap().revision.unwrap(),
        second.unwrap().revision.unwrap(),
    ];
    outcomes.sort_by_key(|r| *r == RevisionRequest::AlreadyProcessing);
    assert_eq!(
        outcomes,
        vec![RevisionRequest::Started, RevisionRequest::AlreadyProcessing]
    );
    assert_eq!(
        harness.pipeline.revision(&token).await.unwrap(),
        RevisionStatus::Processing
    );

    harness.pipeline.drain().await;

    assert_eq!(harness.model.call_count(), calls_before + 1);
    match harness.pipeline.revision(&token).await.unwrap() {
        RevisionStatus::Revised(revised) => {
            assert!(revised.answer.starts_with("修订"));
            assert_eq!(revised.feedback_token, token);
        }
        other => panic!("expected a revised answer, got {other:?}"),
    }

    harness.stop().await;
}

#[tokio::test]
async fn unrecognized_query_gets_fixed_answer() {
    // No keyword matches and the model has no classification for it.
    let harness = Harness::start(MockModel::new().with_response("请整合", INTEGRATED)).await;

    let output = harness.pipeline.process(None, "明天会下雨吗").await;

    assert_eq!(output.status, AnswerStatus::Fallback);
    assert!(!output.session_id.is_empty());
    assert!(Uuid::parse_str(&output.feedback_token).is_ok());
    assert_eq!(harness.model.call_count(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn oversize_query_asks_for_clarification() {
    let harness = Harness::start(model()).await;

    let output = harness.pipeline.process(Some("sess-long"), &"体测".repeat(150)).await;

    assert_eq!(output.status, AnswerStatus::Clarification);
    assert_eq!(harness.model.call_count(), 0);
    assert!(Uuid::parse_str(&output.feedback_token).is_ok());

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn missing_listener_degrades_without_waiting() {
    let model = Arc::new(model());
    let pipeline = PipelineBuilder::new(PipelineConfig::default())
        .with_model(model.clone())
        .with_knowledge(knowledge())
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    let output = pipeline.process(Some("sess-nolistener"), "羽毛球场怎么预订").await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(output.status, AnswerStatus::Answered);
    assert!(output.sources.is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_listener_degrades_after_result_wait() {
    let wait = Duration::from_secs(2);
    let model = Arc::new(model());
    let config = PipelineConfig::default()
        .with_retrieval(RetrievalConfig::default().with_overall_timeout_ms(1_000))
        .with_broker(BrokerConfig::default().with_result_wait_ms(wait.as_millis() as u64));
    let pipeline = PipelineBuilder::new(config)
        .with_model(model.clone())
        .with_knowledge(knowledge())
        .build()
        .unwrap();
    // Subscribed, so the request counts as delivered, but never answered.
    let _silent = pipeline.broker().subscribe_retrieval_requests().await.unwrap();

    let started = tokio::time::Instant::now();
    let output = pipeline.process(Some("sess-silent"), "羽毛球场怎么预订").await;

    let elapsed = started.elapsed();
    assert!(elapsed >= wait);
    assert!(elapsed < wait + Duration::from_millis(100));
    assert_eq!(output.status, AnswerStatus::Answered);
    assert!(output.sources.is_empty());

    // Generation ran once, on the degraded placeholder.
    let prompts = model.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains(r#""status": "error""#));
    assert!(prompts[0].contains("retrieval timed out"));
}

#[tokio::test(start_paused = true)]
async fn retrieval_emits_error_when_every_source_hangs() {
    let hang = Duration::from_secs(24 * 3600);
    let config = RetrievalConfig::default()
        .with_web_search(true)
        .with_external_api(true)
        .with_subtask_timeout_ms(hang.as_millis() as u64);
    let overall = config.overall_timeout();
    let stage = RetrievalStage::new(
        Arc::new(MockKnowledgeBase::new().with_delay(hang)),
        Arc::new(MockModel::new().with_default_response("北京大学 体育馆").with_delay(hang)),
        config,
    )
    .with_external_api(Arc::new(MockExternalApi::new().with_delay(hang)))
    .with_web_searcher(Arc::new(MockWebSearcher::new()));

    let request = RetrievalRequest::from_intent(
        &IntentResult::new("sess-hang", Intent::FacilityQuery, 0.9),
        "羽毛球场怎么预订",
    )
    .with_web(true);

    let started = tokio::time::Instant::now();
    let result = stage.retrieve(&request).await;

    assert!(started.elapsed() <= overall + Duration::from_millis(100));
    assert_eq!(result.status(), RetrievalStatus::Error);
    assert_eq!(result.data["status"], "error");
}

#[tokio::test]
async fn records_survive_the_store_unchanged() {
    let store = MemoryStore::new();

    let intent = IntentResult::new("s", Intent::ExtraExercise, 0.9)
        .with_entity("info_type", serde_json::json!("rewards"));
    let mut retrieval = RetrievalResult::with_status("s", RetrievalStatus::Success, "ok");
    retrieval.sources = vec!["PKU Extracurricular Exercise Handbook".into()];
    retrieval.media_assets = vec![MediaAsset::image("https://cdn.example.com/runner.png").with_caption("PKU Runner")];
    let output = GenerationOutput {
        session_id: "s".into(),
        answer: "里程奖励按学期累计".into(),
        media: Vec::new(),
        feedback_token: Uuid::new_v4().to_string(),
        sources: retrieval.sources.clone(),
        related_queries: vec!["85km 怎么算？".into()],
        status: AnswerStatus::Answered,
    };

    store.set_json("k:intent", &intent, None).await.unwrap();
    store.set_json("k:retrieval", &retrieval, None).await.unwrap();
    store.set_json("k:output", &output, None).await.unwrap();

    assert_eq!(store.get_json::<IntentResult>("k:intent").await.unwrap(), Some(intent));
    assert_eq!(store.get_json::<RetrievalResult>("k:retrieval").await.unwrap(), Some(retrieval));
    assert_eq!(store.get_json::<GenerationOutput>("k:output").await.unwrap(), Some(output));
}
