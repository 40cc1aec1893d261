//! Feedback records and the per-token revision state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::generation::{GenerationInput, GenerationOutput};
use super::retrieval::Context;

/// Lifecycle of a feedback token: `pending -> processing -> {processed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackState {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl FeedbackState {
    /// Whether moving to `next` is a legal transition.
    ///
    /// Finished tokens may be revised again, so `processed` and `failed`
    /// both lead back to `processing`.
    pub fn can_transition_to(&self, next: FeedbackState) -> bool {
        use FeedbackState::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processed, Processing)
                | (Failed, Processing)
                | (Processing, Processed)
                | (Processing, Failed)
        )
    }
}

/// A user's feedback on one answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub session_id: String,
    pub feedback_token: String,
    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(default)]
    pub suggestions: Option<String>,
    #[serde(default)]
    pub context: Context,
}

impl FeedbackRecord {
    pub fn new(session_id: impl Into<String>, feedback_token: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            feedback_token: feedback_token.into(),
            rating: None,
            suggestions: None,
            context: Context::new(),
        }
    }

    pub fn with_rating(mut self, rating: u8) -> Self {
        self.rating = Some(rating);
        self
    }

    pub fn with_suggestions(mut self, suggestions: impl Into<String>) -> Self {
        self.suggestions = Some(suggestions.into());
        self
    }

    /// Suggestion text, if present and not blank.
    pub fn suggestion_text(&self) -> Option<&str> {
        self.suggestions
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Everything stored under `feedback:{token}`.
///
/// Written by generation on every path, then updated in place by revisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub input: GenerationInput,
    pub output: GenerationOutput,
    pub status: FeedbackState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub last_feedback: Option<FeedbackRecord>,
    #[serde(default)]
    pub revision_count: u32,
}

impl GenerationRecord {
    pub fn new(input: GenerationInput, output: GenerationOutput, error: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            input,
            output,
            status: FeedbackState::Pending,
            created_at: now,
            updated_at: now,
            error,
            last_feedback: None,
            revision_count: 0,
        }
    }

    pub fn token(&self) -> &str {
        &self.output.feedback_token
    }

    /// Move to `next`, returning false (and leaving the record untouched) if illegal.
    pub fn transition(&mut self, next: FeedbackState) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}

/// Alert published when a rating falls at or below the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingAlert {
    pub session_id: String,
    pub feedback_token: String,
    pub rating: u8,
    pub threshold: u8,
    pub ratings_count: i64,
    pub average_rating: f64,
    pub raised_at: DateTime<Utc>,
}

/// Result of recording a rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatingOutcome {
    /// Counted; `alerted` is true if an alert was published
    Recorded { alerted: bool },
    /// A rating for this token was already counted
    Duplicate,
}

/// Result of requesting a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionRequest {
    /// This submission acquired the lock; a revision is running
    Started,
    /// Another revision for the token is already in progress
    AlreadyProcessing,
}

/// Acknowledgement for a feedback submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackReceipt {
    pub feedback_token: String,
    pub rating: Option<RatingOutcome>,
    pub revision: Option<RevisionRequest>,
}

/// What a client polling a token observes.
#[derive(Debug, Clone, PartialEq)]
pub enum RevisionStatus {
    /// A revised answer is available
    Revised(GenerationOutput),
    /// A revision is running
    Processing,
    /// The last revision failed
    Failed(String),
    /// No revision has been requested
    NotRequested,
    /// Unknown or expired token
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use FeedbackState::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Processed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processed.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Processed));
        assert!(!Processing.can_transition_to(Processing));
    }

    #[test]
    fn test_blank_suggestion_is_ignored() {
        let record = FeedbackRecord::new("s", "t").with_suggestions("   ");
        assert_eq!(record.suggestion_text(), None);
        let record = FeedbackRecord::new("s", "t").with_suggestions(" 说得更详细些 ");
        assert_eq!(record.suggestion_text(), Some("说得更详细些"));
    }
}
