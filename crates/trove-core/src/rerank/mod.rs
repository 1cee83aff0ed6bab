//! Cross-Encoder Reranker
//!
//! Two-stage retrieval: a fast, high-recall candidate pass followed by a
//! high-precision rerank of the top candidates. The neural path scores each
//! (query, passage) pair jointly with a cross-encoder; when the model is
//! unavailable, scoring falls back to cosine similarity over pooled
//! embeddings.
//!
//! The pipeline never fails because of this module: budget exhaustion or a
//! missing model returns the input unchanged with a diagnostic annotation.

#[cfg(feature = "embeddings")]
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};

use std::sync::Arc;
#[cfg(feature = "embeddings")]
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::chunk::SearchResult;
use crate::embeddings::{cosine_to_unit, EmbeddingProvider};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Default pairs scored per inference batch
pub const DEFAULT_BATCH_SIZE: usize = 8;

/// Passage character budget per pair (approximates the model token budget)
pub const DEFAULT_PASSAGE_CHAR_BUDGET: usize = 2048;

/// Weight of the original score in the combined score
const ORIGINAL_WEIGHT: f32 = 0.3;

/// Weight of the reranker score in the combined score
const RERANK_WEIGHT: f32 = 0.7;

/// Reranker scores above this earn a multiplicative boost
const BOOST_THRESHOLD: f32 = 0.8;

/// The boost factor
const BOOST_FACTOR: f32 = 1.1;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Reranker configuration
#[derive(Debug, Clone)]
pub struct RerankConfig {
    /// Pairs per inference batch
    pub batch_size: usize,
    /// Per-pair passage truncation budget, in chars
    pub passage_char_budget: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            passage_char_budget: DEFAULT_PASSAGE_CHAR_BUDGET,
        }
    }
}

// ============================================================================
// RERANKER
// ============================================================================

/// Cross-encoder reranker with an embedding-similarity fallback
///
/// The cross-encoder model is NOT loaded at construction — call `init()`
/// during engine startup. Construction stays fast and test-friendly.
pub struct CrossEncoderReranker {
    config: RerankConfig,
    provider: Arc<EmbeddingProvider>,
    #[cfg(feature = "embeddings")]
    cross_encoder: Mutex<Option<TextRerank>>,
}

impl CrossEncoderReranker {
    /// Create a reranker sharing the engine's embedding provider
    pub fn new(config: RerankConfig, provider: Arc<EmbeddingProvider>) -> Self {
        Self {
            config,
            provider,
            #[cfg(feature = "embeddings")]
            cross_encoder: Mutex::new(None),
        }
    }

    /// Load the cross-encoder model (downloads once into the model cache
    /// directory). Returns whether the neural path is available afterwards.
    pub fn init(&self) -> bool {
        #[cfg(feature = "embeddings")]
        {
            let mut guard = self.cross_encoder.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_some() {
                return true;
            }

            let cache_dir = crate::embeddings::model_cache_dir();
            let options = RerankInitOptions::new(RerankerModel::JINARerankerV1TurboEn)
                .with_show_download_progress(false)
                .with_cache_dir(cache_dir);

            match TextRerank::try_new(options) {
                Ok(model) => {
                    tracing::info!("cross-encoder reranker loaded (Jina Reranker v1 Turbo)");
                    *guard = Some(model);
                    true
                }
                Err(e) => {
                    tracing::warn!("cross-encoder unavailable, using similarity fallback: {e}");
                    false
                }
            }
        }
        #[cfg(not(feature = "embeddings"))]
        {
            false
        }
    }

    /// Whether the neural path is loaded
    pub fn has_cross_encoder(&self) -> bool {
        #[cfg(feature = "embeddings")]
        {
            self.cross_encoder
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some()
        }
        #[cfg(not(feature = "embeddings"))]
        {
            false
        }
    }

    /// Pay first-inference cost off the critical path by scoring one dummy
    /// pair
    pub fn warmup(&self) {
        #[cfg(feature = "embeddings")]
        {
            let mut guard = self.cross_encoder.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(model) = guard.as_mut() {
                let started = Instant::now();
                let _ = model.rerank("warmup", &["warmup passage"], false, None);
                tracing::debug!("reranker warmup took {:?}", started.elapsed());
            }
        }
    }

    /// Rerank candidates by joint (query, passage) relevance.
    ///
    /// Combined score: `0.3 * original + 0.7 * rerank`, with a 10% boost
    /// when the rerank score clears 0.8, clamped to 1.0. On budget
    /// exhaustion or when no scoring path works, the input comes back
    /// unchanged (truncated to `limit`) with a diagnostic.
    pub async fn rerank(
        &self,
        query: &str,
        mut candidates: Vec<SearchResult>,
        limit: usize,
        budget: Duration,
    ) -> Vec<SearchResult> {
        if candidates.is_empty() || query.trim().is_empty() {
            candidates.truncate(limit);
            return candidates;
        }

        let started = Instant::now();
        let before: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();

        let scores = match self.score_pairs(query, &candidates, started, budget).await {
            Some(scores) => scores,
            None => {
                for candidate in &mut candidates {
                    candidate
                        .annotations
                        .diagnostics
                        .push("reranker_skipped".to_string());
                }
                candidates.truncate(limit);
                return candidates;
            }
        };

        for (candidate, rerank_score) in candidates.iter_mut().zip(scores.iter()) {
            candidate.note_original_score();
            candidate.annotations.cross_encoder_score = Some(*rerank_score);

            let mut combined = ORIGINAL_WEIGHT * candidate.score + RERANK_WEIGHT * rerank_score;
            if *rerank_score > BOOST_THRESHOLD {
                combined *= BOOST_FACTOR;
            }
            candidate.score = combined.clamp(0.0, 1.0);
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(limit);

        log_rank_movements(&before, &candidates);

        candidates
    }

    /// Score every (query, candidate) pair in [0, 1]; `None` means the
    /// rerank must be skipped entirely
    async fn score_pairs(
        &self,
        query: &str,
        candidates: &[SearchResult],
        started: Instant,
        budget: Duration,
    ) -> Option<Vec<f32>> {
        if started.elapsed() >= budget {
            return None;
        }

        #[cfg(feature = "embeddings")]
        if let Some(scores) = self.score_neural(query, candidates, started, budget) {
            return Some(scores);
        }

        self.score_by_similarity(query, candidates, started, budget)
            .await
    }

    /// Neural path: batched cross-encoder inference, sigmoid-mapped
    #[cfg(feature = "embeddings")]
    fn score_neural(
        &self,
        query: &str,
        candidates: &[SearchResult],
        started: Instant,
        budget: Duration,
    ) -> Option<Vec<f32>> {
        let mut guard = self.cross_encoder.lock().unwrap_or_else(|e| e.into_inner());
        let model = guard.as_mut()?;

        let mut scores = vec![0.0_f32; candidates.len()];
        for (batch_index, batch) in candidates.chunks(self.config.batch_size).enumerate() {
            if started.elapsed() >= budget {
                tracing::debug!("reranker budget exhausted mid-batch, aborting neural path");
                return None;
            }

            let passages: Vec<&str> = batch
                .iter()
                .map(|c| truncate_passage(&c.content, self.config.passage_char_budget))
                .collect();

            let batch_results = match model.rerank(query, &passages, false, None) {
                Ok(results) => results,
                Err(e) => {
                    tracing::warn!("cross-encoder inference failed: {e}");
                    return None;
                }
            };

            let offset = batch_index * self.config.batch_size;
            for result in batch_results {
                if let Some(slot) = scores.get_mut(offset + result.index) {
                    *slot = sigmoid(result.score);
                }
            }
        }

        Some(scores)
    }

    /// Fallback path: cosine similarity over pooled embeddings, mapped
    /// `(cos + 1) / 2`
    async fn score_by_similarity(
        &self,
        query: &str,
        candidates: &[SearchResult],
        started: Instant,
        budget: Duration,
    ) -> Option<Vec<f32>> {
        if started.elapsed() >= budget {
            return None;
        }

        let query_embedding = self.provider.embed(query).await.ok()?;

        let passages: Vec<&str> = candidates
            .iter()
            .map(|c| truncate_passage(&c.content, self.config.passage_char_budget))
            .collect();
        let passage_embeddings = self.provider.embed_batch(&passages).await.ok()?;

        Some(
            passage_embeddings
                .iter()
                .map(|e| cosine_to_unit(query_embedding.cosine_similarity(e)))
                .collect(),
        )
    }
}

/// Logistic map from a raw model logit into [0, 1]
#[cfg(any(feature = "embeddings", test))]
#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Truncate a passage to the per-pair budget on a char boundary
fn truncate_passage(content: &str, budget: usize) -> &str {
    if content.len() <= budget {
        return content;
    }
    let mut end = budget;
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    &content[..end]
}

/// Debug-log how candidates moved during the rerank
fn log_rank_movements(before: &[String], after: &[SearchResult]) {
    for (new_position, candidate) in after.iter().enumerate() {
        if let Some(old_position) = before.iter().position(|id| *id == candidate.id) {
            if old_position != new_position {
                tracing::debug!(
                    "rerank moved {} from position {} to {}",
                    candidate.id,
                    old_position,
                    new_position
                );
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
