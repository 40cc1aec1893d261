//! Property tests for input handling.

use std::sync::Arc;

use proptest::prelude::*;
use query_pipeline::parse::extract_object;
use query_pipeline::stages::intent::Rejection;
use query_pipeline::testing::MockModel;
use query_pipeline::text::{char_len, hash, normalize};
use query_pipeline::{Intent, IntentConfig, IntentRegistry, IntentStage, MemoryStore};

fn stage(model: Arc<MockModel>) -> IntentStage {
    IntentStage::new(
        Arc::new(IntentRegistry::default()),
        Arc::new(MemoryStore::new()),
        model,
        IntentConfig::default(),
    )
}

proptest! {
    #[test]
    fn prop_normalize_is_idempotent(s in "[ a-zA-Z0-9０-９ａ-ｚＡ-Ｚ体测跑步，。？]{0,64}") {
        let once = normalize(&s);
        prop_assert_eq!(normalize(&once), once);
    }

    #[test]
    fn prop_equal_inputs_share_a_cache_key(s in "[a-z0-9 ]{1,40}") {
        let padded = format!("  {s}  ");
        prop_assert_eq!(hash(&normalize(&s)), hash(&normalize(&padded)));
    }

    #[test]
    fn prop_extract_object_never_panics(s in "\\PC{0,200}") {
        let _ = extract_object(&s);
    }

    #[test]
    fn prop_oversize_input_never_reaches_model(extra in 1usize..200, ch in "[体测跑步a-z]") {
        let max = IntentConfig::default().max_input_length;
        let input = ch.repeat(max + extra);
        let model = Arc::new(MockModel::new().with_default_response(
            r#"{"intent": "facility_query", "confidence": 0.99}"#,
        ));
        let stage = stage(model.clone());

        prop_assert_eq!(
            stage.check_safety(&input),
            Some(Rejection::TooLong { length: char_len(&input), max })
        );

        let result = tokio_test::block_on(stage.extract("sess-prop", &input));

        prop_assert!(result.clarification_needed);
        prop_assert_eq!(result.intent, Intent::Unrecognized);
        prop_assert_eq!(model.call_count(), 0);
    }

    #[test]
    fn prop_input_at_limit_passes_length_check(ch in "[体测跑步a-z]") {
        let config = IntentConfig::default();
        let input = ch.repeat(config.max_input_length);
        let stage = stage(Arc::new(MockModel::new()));

        let rejection = stage.check_safety(&input);

        prop_assert!(!matches!(rejection, Some(Rejection::TooLong { .. })), "unexpected TooLong rejection: {:?}", rejection);
    }
}
