//! Generation input/output records.

use serde::{Deserialize, Serialize};

use super::intent::{Entities, Intent, IntentResult};
use super::retrieval::{Context, MediaAsset, RetrievalResult};

/// Everything the generation stage needs for one answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationInput {
    pub session_id: String,
    pub query: String,
    pub intent: Intent,
    #[serde(default)]
    pub entities: Entities,
    #[serde(default)]
    pub confidence: f64,
    /// Integrated retrieval payload (`data` of the retrieval result).
    #[serde(default)]
    pub retrieved: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub media_assets: Vec<MediaAsset>,
    #[serde(default)]
    pub is_web_fallback: bool,
    /// Intent-specific derived values (BMI, goal, feedback subtype).
    #[serde(default)]
    pub enrichments: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_prompt: Option<String>,
}

impl GenerationInput {
    /// Assemble generation input from the outputs of the earlier stages.
    pub fn from_stages(
        intent: &IntentResult,
        query: impl Into<String>,
        retrieval: &RetrievalResult,
    ) -> Self {
        let query = query.into();
        let enrichments = enrich(intent.intent, &intent.entities, &query);
        Self {
            session_id: intent.session_id.clone(),
            intent: intent.intent,
            entities: intent.entities.clone(),
            confidence: intent.confidence,
            retrieved: retrieval.data.clone(),
            sources: retrieval.sources.clone(),
            media_assets: retrieval.media_assets.clone(),
            is_web_fallback: retrieval.is_web_fallback(),
            enrichments,
            clarification_prompt: intent.clarification_prompt.clone(),
            query,
        }
    }

    /// Input for a session that never reached retrieval.
    pub fn without_retrieval(intent: &IntentResult, query: impl Into<String>) -> Self {
        let query = query.into();
        Self {
            session_id: intent.session_id.clone(),
            intent: intent.intent,
            entities: intent.entities.clone(),
            confidence: intent.confidence,
            retrieved: serde_json::Map::new(),
            sources: Vec::new(),
            media_assets: Vec::new(),
            is_web_fallback: false,
            enrichments: Context::new(),
            clarification_prompt: intent.clarification_prompt.clone(),
            query,
        }
    }
}

fn entity_number(entities: &Entities, key: &str) -> Option<f64> {
    match entities.get(key)? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s
            .trim()
            .trim_end_matches(|c: char| c.is_alphabetic())
            .trim()
            .parse()
            .ok(),
        _ => None,
    }
}

/// Body-mass index from height in centimetres and weight in kilograms.
pub fn bmi(height_cm: f64, weight_kg: f64) -> Option<f64> {
    if height_cm <= 0.0 || weight_kg <= 0.0 {
        return None;
    }
    let metres = height_cm / 100.0;
    Some((weight_kg / (metres * metres) * 10.0).round() / 10.0)
}

/// Classify free-form feedback text.
pub fn feedback_subtype(text: &str) -> &'static str {
    const COMPLAINT: [&str; 5] = ["投诉", "态度差", "不好用", "太差", "维修"];
    const SUGGESTION: [&str; 3] = ["建议", "改进", "希望"];
    if COMPLAINT.iter().any(|k| text.contains(k)) {
        "complaint"
    } else if SUGGESTION.iter().any(|k| text.contains(k)) {
        "suggestion"
    } else {
        "general"
    }
}

fn health_goal(entities: &Entities, text: &str) -> String {
    if let Some(goal) = entities.get("goal").and_then(|v| v.as_str()) {
        return goal.to_string();
    }
    if text.contains("减肥") || text.contains("减脂") {
        "weight_loss".to_string()
    } else if text.contains("增肌") {
        "muscle_gain".to_string()
    } else {
        "general_fitness".to_string()
    }
}

fn enrich(intent: Intent, entities: &Entities, query: &str) -> Context {
    let mut out = Context::new();
    match intent {
        Intent::PhysicalTest => {
            let height = entity_number(entities, "height");
            let weight = entity_number(entities, "weight");
            if let (Some(h), Some(w)) = (height, weight) {
                if let Some(value) = bmi(h, w) {
                    out.insert("bmi".into(), serde_json::json!(value));
                }
            }
        }
        Intent::HealthAdvice => {
            out.insert("goal".into(), health_goal(entities, query).into());
        }
        Intent::Feedback => {
            out.insert("feedback_type".into(), feedback_subtype(query).into());
        }
        _ => {}
    }
    out
}

/// How an answer was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    /// Model produced the answer
    Answered,
    /// Fixed answer for an unrecognized intent
    Fallback,
    /// Clarification requested from the user
    Clarification,
    /// No template configured for the intent
    Unconfigured,
    /// Model failed after retries
    Failed,
}

/// Final answer for a session, bound to a feedback token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub session_id: String,
    pub answer: String,
    #[serde(default)]
    pub media: Vec<MediaAsset>,
    pub feedback_token: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub related_queries: Vec<String>,
    pub status: AnswerStatus,
}

impl GenerationOutput {
    pub fn is_degraded(&self) -> bool {
        matches!(self.status, AnswerStatus::Unconfigured | AnswerStatus::Failed)
    }
}
