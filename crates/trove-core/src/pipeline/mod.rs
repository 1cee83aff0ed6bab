//! Retrieval Pipeline
//!
//! Orchestrates a named, ordered sequence of stages: staged candidate
//! generation, merge, rerank, filter. Four profiles ship (`fast`,
//! `balanced`, `accurate`, `research`).
//!
//! Failure model: any stage error is caught and execution proceeds with the
//! previous stage's output; a stage that overruns its slice of the deadline
//! is abandoned the same way. The pipeline never raises to callers — a
//! zero-result outcome is a legitimate final answer.

mod profile;
mod stages;

pub use profile::{SearchProfile, StageConfig, StageKind};
pub(crate) use stages::query_tokens;
pub(crate) use stages::{hybrid_merge, merge_candidates};

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::cache::MultiTierCache;
use crate::chunk::SearchResult;
use crate::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::enhance::{ContextualEnhancer, DocumentContext, EnhanceError};
use crate::index::{KeywordIndex, VectorIndex, VectorIndexError};
use crate::rerank::CrossEncoderReranker;
use crate::store::{ChunkStore, StoreError};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Internal stage error; never crosses the pipeline boundary
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Chunk store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// Vector index failure
    #[error("vector index error: {0}")]
    Vector(#[from] VectorIndexError),
    /// Embedding failure on every backend
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
    /// Enhancement failure
    #[error("enhancement error: {0}")]
    Enhance(#[from] EnhanceError),
    /// A candidate references a chunk the store no longer has
    #[error("chunk missing from store: {0}")]
    MissingChunk(String),
}

// ============================================================================
// OPTIONS
// ============================================================================

/// Per-call search options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    /// Pipeline profile
    pub profile: SearchProfile,
    /// Maximum results returned
    pub limit: usize,
    /// Context for the contextual enhancer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<DocumentContext>,
    /// Consult the query cache before running the pipeline
    pub use_cache: bool,
    /// Allow the cross-encoder rerank stage
    pub rerank: bool,
    /// Confidence floor feeding the early-termination guard
    pub min_confidence: f32,
    /// Wall-clock budget for the whole call
    #[serde(with = "duration_millis")]
    pub max_latency: Duration,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            profile: SearchProfile::default(),
            limit: 10,
            context: None,
            use_cache: true,
            rerank: true,
            min_confidence: 0.3,
            max_latency: Duration::from_secs(5),
        }
    }
}

mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (value.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

// ============================================================================
// DEADLINE
// ============================================================================

/// Shared wall-clock deadline for one pipeline run
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    /// Start the clock with the given budget
    pub fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    /// Time elapsed since the clock started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Budget left, zero once expired
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    /// Whether the budget is spent
    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Per-stage metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageMetrics {
    /// Stage name
    pub stage: String,
    /// Stage wall time in ms
    pub duration_ms: u64,
    /// Candidate count after the stage
    pub candidates: usize,
    /// Mean candidate score after the stage
    pub avg_score: f32,
    /// The stage overran its slice and its output was discarded
    pub timed_out: bool,
    /// The stage was skipped (deadline or early termination)
    pub skipped: bool,
}

/// Whole-run metrics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMetrics {
    /// Total wall time in ms
    pub total_ms: u64,
    /// Per-stage breakdown
    pub stages: Vec<StageMetrics>,
    /// Final result count
    pub result_count: usize,
    /// The early-termination latency guard fired
    pub early_terminated: bool,
    /// The deadline expired before all stages ran
    pub deadline_reached: bool,
}

// ============================================================================
// SERVICES
// ============================================================================

/// Non-owning views of the engine's services, shared with the pipeline
#[derive(Clone)]
pub struct PipelineServices {
    /// Chunk store (source of truth)
    pub store: Arc<ChunkStore>,
    /// Keyword index
    pub keyword: Arc<KeywordIndex>,
    /// Vector index
    pub vectors: Arc<RwLock<VectorIndex>>,
    /// Embedding provider
    pub provider: Arc<EmbeddingProvider>,
    /// Multi-tier cache
    pub cache: Arc<MultiTierCache>,
    /// Cross-encoder reranker, absent when degraded
    pub reranker: Option<Arc<CrossEncoderReranker>>,
    /// Contextual enhancer, absent when degraded
    pub enhancer: Option<Arc<ContextualEnhancer>>,
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Minimum slice of the deadline any stage receives
const MIN_STAGE_TIMEOUT: Duration = Duration::from_millis(5);

/// The staged retrieval pipeline
pub struct RetrievalPipeline {
    services: PipelineServices,
}

impl RetrievalPipeline {
    /// Create a pipeline over the engine's services
    pub fn new(services: PipelineServices) -> Self {
        Self { services }
    }

    /// Run the profile's stages for a query.
    ///
    /// `on_stage` receives `(stage name, completed fraction)` after each
    /// stage; the façade forwards it to its event channel. Never fails: a
    /// zero-result outcome is a legitimate answer.
    pub async fn run(
        &self,
        query: &str,
        opts: &SearchOptions,
        on_stage: &(dyn Fn(&str, f32) + Send + Sync),
    ) -> (Vec<SearchResult>, PipelineMetrics) {
        let deadline = Deadline::start(opts.max_latency);
        let mut metrics = PipelineMetrics::default();

        if opts.limit == 0 {
            return (vec![], metrics);
        }

        let stage_configs = opts.profile.stages();
        let total_stages = stage_configs.len();
        let mut candidates: Vec<SearchResult> = Vec::new();

        for (position, stage) in stage_configs.iter().enumerate() {
            if !stage.enabled {
                metrics.stages.push(skipped_stage(stage.kind));
                continue;
            }

            if deadline.expired() {
                tracing::debug!("deadline reached before {}", stage.kind.name());
                metrics.deadline_reached = true;
                metrics.stages.push(skipped_stage(stage.kind));
                continue;
            }

            // Early termination: enough confident candidates already
            let confident = candidates
                .iter()
                .filter(|c| c.score >= opts.min_confidence * 1.5)
                .count();
            if confident >= 2 * opts.limit && stage.kind != StageKind::QualityFilter {
                metrics.early_terminated = true;
                metrics.stages.push(skipped_stage(stage.kind));
                continue;
            }

            let target = stage.target(opts.limit);
            let remaining_stages = (total_stages - position) as u32;
            let stage_budget = (deadline.remaining() / remaining_stages).max(MIN_STAGE_TIMEOUT);

            let stage_started = Instant::now();
            let input = candidates.clone();
            let outcome = tokio::time::timeout(
                stage_budget,
                self.run_stage(stage.kind, query, opts, input, target, stage_budget),
            )
            .await;

            let mut timed_out = false;
            match outcome {
                Ok(Ok(output)) => candidates = output,
                Ok(Err(e)) => {
                    tracing::warn!("stage {} failed, keeping input: {}", stage.kind.name(), e);
                }
                Err(_) => {
                    tracing::warn!(
                        "stage {} exceeded its {}ms budget, keeping input",
                        stage.kind.name(),
                        stage_budget.as_millis()
                    );
                    timed_out = true;
                }
            }

            let avg_score = if candidates.is_empty() {
                0.0
            } else {
                candidates.iter().map(|c| c.score).sum::<f32>() / candidates.len() as f32
            };
            metrics.stages.push(StageMetrics {
                stage: stage.kind.name().to_string(),
                duration_ms: stage_started.elapsed().as_millis() as u64,
                candidates: candidates.len(),
                avg_score,
                timed_out,
                skipped: false,
            });

            on_stage(stage.kind.name(), (position + 1) as f32 / total_stages as f32);
        }

        // The scoring contract holds on every exit path: when the deadline
        // skipped the quality filter, the partial candidate set is still
        // clamped, sorted, and truncated (confidence adjustments are the
        // quality filter's alone and are not reapplied here)
        let quality_filter_ran = metrics
            .stages
            .iter()
            .any(|s| s.stage == StageKind::QualityFilter.name() && !s.skipped && !s.timed_out);
        let mut results = if quality_filter_ran {
            candidates
        } else {
            stages::sort_by_score(&mut candidates);
            for candidate in &mut candidates {
                candidate.score = candidate.score.clamp(0.0, 1.0);
            }
            candidates.truncate(opts.limit);
            candidates
        };
        if metrics.deadline_reached {
            for result in &mut results {
                result.annotations.deadline_reached = true;
            }
        }

        metrics.total_ms = deadline.elapsed().as_millis() as u64;
        metrics.result_count = results.len();
        (results, metrics)
    }

    async fn run_stage(
        &self,
        kind: StageKind,
        query: &str,
        opts: &SearchOptions,
        input: Vec<SearchResult>,
        target: usize,
        stage_budget: Duration,
    ) -> Result<Vec<SearchResult>, PipelineError> {
        let services = &self.services;
        match kind {
            StageKind::BroadKeyword => stages::broad_keyword(services, query, input, target).await,
            StageKind::ExhaustiveKeyword => {
                stages::exhaustive_keyword(services, query, input, target).await
            }
            StageKind::VectorSearch => stages::vector_search(services, query, input, target).await,
            StageKind::DeepVector => stages::deep_vector(services, query, input, target).await,
            StageKind::HybridMerge => Ok(stages::hybrid_merge(input, target)),
            StageKind::MultiStrategy => {
                stages::multi_strategy(services, query, input, target).await
            }
            StageKind::Contextual => {
                stages::contextual(services, query, opts, input, target).await
            }
            StageKind::DocumentExpansion => {
                stages::document_expansion(services, input, target).await
            }
            StageKind::HeuristicRerank => Ok(stages::heuristic_rerank(query, input)),
            StageKind::CrossEncoderRerank => {
                Ok(self.cross_encoder_stage(query, opts, input, target, stage_budget).await)
            }
            StageKind::ContextEnrichment => {
                stages::context_enrichment(services, input, target).await
            }
            StageKind::SemanticExpansion => {
                stages::semantic_expansion(services, query, input, target).await
            }
            StageKind::QualityFilter => Ok(stages::quality_filter(input, opts.limit)),
        }
    }

    /// Delegate to the reranker; absence or an opt-out returns the input
    /// unchanged with a diagnostic
    async fn cross_encoder_stage(
        &self,
        query: &str,
        opts: &SearchOptions,
        mut input: Vec<SearchResult>,
        target: usize,
        stage_budget: Duration,
    ) -> Vec<SearchResult> {
        if !opts.rerank {
            return input;
        }
        match &self.services.reranker {
            Some(reranker) => reranker.rerank(query, input, target, stage_budget).await,
            None => {
                for candidate in &mut input {
                    candidate
                        .annotations
                        .diagnostics
                        .push("reranker_unavailable".to_string());
                }
                input
            }
        }
    }
}

fn skipped_stage(kind: StageKind) -> StageMetrics {
    StageMetrics {
        stage: kind.name().to_string(),
        duration_ms: 0,
        candidates: 0,
        avg_score: 0.0,
        timed_out: false,
        skipped: true,
    }
}

// ============================================================================
// TESTS
// ============================================================================
