//! In-memory keyword-scored knowledge base.
//!
//! Documents are loaded once (from code or a JSON file) and never mutated.
//! Scoring is keyword containment: one hit scores 0.75, each further hit
//! adds 0.05, capped at 1.0.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::text;
use crate::traits::knowledge::KnowledgeBase;
use crate::types::intent::Intent;
use crate::types::retrieval::{KnowledgeSnippet, MediaAsset};

const FIRST_HIT_SCORE: f32 = 0.75;
const EXTRA_HIT_SCORE: f32 = 0.05;

/// A document in the knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    pub content: String,

    /// Restrict to one intent; `None` matches every intent.
    #[serde(default)]
    pub intent: Option<Intent>,

    pub keywords: Vec<String>,

    #[serde(default)]
    pub source: Option<String>,

    #[serde(default)]
    pub media: Vec<MediaAsset>,
}

impl KnowledgeDocument {
    pub fn new(content: impl Into<String>, keywords: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            content: content.into(),
            intent: None,
            keywords: keywords.into_iter().map(Into::into).collect(),
            source: None,
            media: Vec::new(),
        }
    }

    pub fn for_intent(mut self, intent: Intent) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_media(mut self, asset: MediaAsset) -> Self {
        self.media.push(asset);
        self
    }

    fn score(&self, normalized_query: &str) -> f32 {
        let hits = self
            .keywords
            .iter()
            .filter(|k| !k.is_empty() && normalized_query.contains(&text::normalize(k).to_lowercase()))
            .count();
        match hits {
            0 => 0.0,
            n => (FIRST_HIT_SCORE + EXTRA_HIT_SCORE * (n - 1) as f32).min(1.0),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryKnowledgeBase {
    documents: Vec<KnowledgeDocument>,
}

impl MemoryKnowledgeBase {
    pub fn new(documents: Vec<KnowledgeDocument>) -> Self {
        Self { documents }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let documents: Vec<KnowledgeDocument> = serde_json::from_str(json)
            .map_err(|e| PipelineError::Knowledge(format!("invalid knowledge file: {e}")))?;
        Ok(Self::new(documents))
    }

    /// Load documents from a JSON array file.
    pub async fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PipelineError::Knowledge(format!("{}: {e}", path.display())))?;
        let kb = Self::from_json_str(&json)?;
        info!(path = %path.display(), documents = kb.len(), "Loaded knowledge base");
        Ok(kb)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl KnowledgeBase for MemoryKnowledgeBase {
    async fn search(
        &self,
        query: &str,
        intent: Intent,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<KnowledgeSnippet>> {
        let normalized = text::normalize(query).to_lowercase();

        let mut hits: Vec<KnowledgeSnippet> = self
            .documents
            .iter()
            .filter(|doc| doc.intent.map_or(true, |i| i == intent))
            .filter_map(|doc| {
                let score = doc.score(&normalized);
                (score > 0.0 && score >= min_score).then(|| KnowledgeSnippet {
                    content: doc.content.clone(),
                    score,
                    source: doc.source.clone(),
                    media: doc.media.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);

        debug!(intent = %intent, hits = hits.len(), "Knowledge search");
        Ok(hits)
    }
}
