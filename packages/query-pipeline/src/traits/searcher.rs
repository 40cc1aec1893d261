//! Web searcher trait for open-world fallback.
//!
//! Web search is only consulted when globally enabled and the request asks
//! for it; the knowledge base always takes precedence in `sources`.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::retrieval::WebHit;

/// Web search provider (Tavily, SerpAPI, mocks).
#[async_trait]
pub trait WebSearcher: Send + Sync {
    /// Search the web, returning at most `limit` hits.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<WebHit>>;
}
