//! External HTTP collaborators: per-intent data APIs and a secondary classifier.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::intent::{Entities, Intent};

/// Per-intent structured data source (facility schedules, event listings).
#[async_trait]
pub trait ExternalApi: Send + Sync {
    /// Fetch raw JSON for an intent.
    ///
    /// Returns `Ok(None)` when no endpoint is configured for the intent.
    async fn fetch(
        &self,
        intent: Intent,
        entities: &Entities,
        query: &str,
    ) -> Result<Option<serde_json::Value>>;
}

/// Label and confidence returned by a secondary classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiClassification {
    pub intent: String,
    pub confidence: f64,
    #[serde(default)]
    pub entities: Entities,
}

/// Best-effort secondary intent classifier.
#[async_trait]
pub trait IntentApi: Send + Sync {
    async fn classify(&self, text: &str) -> Result<ApiClassification>;
}
