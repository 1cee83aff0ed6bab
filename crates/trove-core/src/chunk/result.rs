//! Search result records
//!
//! Results carry a strategy tag describing which retrieval path produced
//! them, plus optional per-stage annotations attached as the pipeline runs.

use serde::{Deserialize, Serialize};

use super::ChunkMetadata;

// ============================================================================
// STRATEGY TAG
// ============================================================================

/// Which retrieval strategy produced (or last re-scored) a result
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Keyword (BM25/FTS5) match
    Keyword,
    /// Dense vector similarity match
    Semantic,
    /// Weighted combination of keyword and vector scores
    Hybrid,
    /// Retrieved via an enhanced (rewritten) query
    Contextual,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Keyword => write!(f, "keyword"),
            Strategy::Semantic => write!(f, "semantic"),
            Strategy::Hybrid => write!(f, "hybrid"),
            Strategy::Contextual => write!(f, "contextual"),
        }
    }
}

// ============================================================================
// STAGE ANNOTATIONS
// ============================================================================

/// Optional per-stage annotations accumulated as a candidate moves through
/// the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StageAnnotations {
    /// Neural cross-encoder relevance score, if the rerank stage ran
    pub cross_encoder_score: Option<f32>,
    /// Score before the last rescoring stage touched this candidate
    pub original_score: Option<f32>,
    /// Whether adjacent-chunk context was attached
    pub context_enriched: bool,
    /// Whether the deadline expired before all stages could run
    pub deadline_reached: bool,
    /// Diagnostics from degraded stages (reranker skipped, stage timeout, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl StageAnnotations {
    /// True when no annotation has been recorded
    pub fn is_empty(&self) -> bool {
        self.cross_encoder_score.is_none()
            && self.original_score.is_none()
            && !self.context_enriched
            && !self.deadline_reached
            && self.diagnostics.is_empty()
    }
}

// ============================================================================
// SEARCH RESULT
// ============================================================================

/// A ranked, relevance-scored passage returned to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    /// Chunk id
    pub id: String,
    /// Content slice for display
    pub content: String,
    /// Relevance score in [0, 1] after final normalization
    pub score: f32,
    /// Source metadata
    pub source_metadata: ChunkMetadata,
    /// Which strategy produced this result
    pub strategy: Strategy,
    /// Human-readable explanation of why the result matched
    pub explanation: String,
    /// Adjacent-chunk context attached by the enrichment stage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Per-stage annotations
    #[serde(default, skip_serializing_if = "StageAnnotations::is_empty")]
    pub annotations: StageAnnotations,
}

impl SearchResult {
    /// Create a result with a bare score and strategy; annotations start empty
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        score: f32,
        metadata: ChunkMetadata,
        strategy: Strategy,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            score,
            source_metadata: metadata,
            strategy,
            explanation: explanation.into(),
            context: None,
            annotations: StageAnnotations::default(),
        }
    }

    /// Approximate byte size of the result payload (query cache accounting)
    pub fn payload_bytes(&self) -> usize {
        self.id.len()
            + self.content.len()
            + self.explanation.len()
            + self.context.as_deref().map_or(0, str::len)
            + std::mem::size_of::<Self>()
    }

    /// Record the pre-rescore score before overwriting `score`
    pub fn note_original_score(&mut self) {
        if self.annotations.original_score.is_none() {
            self.annotations.original_score = Some(self.score);
        }
    }
}
