//! Knowledge store trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{intent::Intent, retrieval::KnowledgeSnippet};

/// Ranked snippet lookup over a document collection.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Return at most `top_k` snippets scoring at least `min_score`, best first.
    ///
    /// `intent` lets implementations scope the search to a collection.
    async fn search(
        &self,
        query: &str,
        intent: Intent,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<KnowledgeSnippet>>;
}
