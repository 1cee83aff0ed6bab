//! # Trove Core
//!
//! Local-first personal knowledge retrieval engine. Ingest document chunks
//! and web pages; issue natural-language queries; get ranked,
//! relevance-scored passages with surrounding context, under a hard latency
//! budget.
//!
//! - **Hybrid search**: SQLite FTS5 keyword index (BM25) + HNSW vector
//!   index (USearch), fused with weighted combination
//! - **Multi-tier cache**: in-memory LRUs per value class, content-addressed
//!   disk persistence, and semantic near-hit matching (a paraphrased query
//!   can serve a cached result when embedding cosine >= 0.95)
//! - **Staged pipeline**: four profiles (`fast`, `balanced`, `accurate`,
//!   `research`) with per-stage candidate multipliers, timeouts, early
//!   termination, and graceful degradation
//! - **Cross-encoder rerank**: joint (query, passage) scoring via a local
//!   ONNX model, with an embedding-similarity fallback
//! - **Contextual enhancement**: query rewriting for better embedding
//!   recall, degraded template enhancement when no generative backend is
//!   configured
//! - **Deterministic fallback embeddings**: the engine stays functional
//!   with zero external dependencies
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use trove_core::{ChunkInput, EngineConfig, SearchEngine};
//!
//! let engine = SearchEngine::new(EngineConfig::default())?;
//! engine.initialize().await?;
//!
//! engine.add_chunk(ChunkInput {
//!     source_id: "notes".into(),
//!     content: "The quick brown fox jumps over the lazy dog".into(),
//!     chunk_index: 0,
//!     metadata: Default::default(),
//! }).await?;
//!
//! let response = engine.search("quick fox", engine.default_options()).await?;
//! for result in response.results {
//!     println!("{:.2} {}", result.score, result.content);
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `embeddings` (default): local ONNX inference with fastembed (embedding
//!   model + cross-encoder reranker)
//! - `bundled-sqlite` (default): bundled SQLite with FTS5

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod cache;
pub mod chunk;
pub mod config;
pub mod embeddings;
pub mod engine;
pub mod enhance;
pub mod index;
pub mod pipeline;
pub mod rerank;
pub mod store;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Chunk & result types
pub use chunk::{
    content_hash, ChunkInput, ChunkMetadata, DocumentChunk, SearchResult, SourceKind,
    StageAnnotations, Strategy,
};

// Embeddings
pub use embeddings::{
    cosine_similarity, cosine_to_unit, Embedding, EmbeddingError, EmbeddingMode,
    EmbeddingProvider, EMBEDDING_DIMENSIONS, FALLBACK_MODEL_ID,
};

// Indices
pub use index::{
    KeywordFilters, KeywordHit, KeywordIndex, VectorHit, VectorIndex, VectorIndexConfig,
    VectorIndexError, VectorIndexStats, VectorMeta,
};

// Store
pub use store::{ChunkStore, StoreError, StoreResult};

// Cache
pub use cache::{
    CacheClass, CacheConfig, CacheHitKind, CacheOpts, CacheStats, MultiTierCache, TierConfig,
};

// Reranker
pub use rerank::{CrossEncoderReranker, RerankConfig};

// Enhancer
pub use enhance::{
    ContextualEnhancer, DocumentContext, EnhanceError, EnhancedText, EnhancementStrategy,
};

// Pipeline
pub use pipeline::{
    PipelineMetrics, PipelineServices, RetrievalPipeline, SearchOptions, SearchProfile,
    StageConfig, StageKind, StageMetrics,
};

// Façade
pub use engine::{
    EngineError, EngineResult, EngineStatistics, SearchEngine, SearchEvent, SearchResponse,
};

// Configuration
pub use config::{DataLayout, EngineConfig};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default local embedding model
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-ai/nomic-embed-text-v1.5";

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        ChunkInput, ChunkMetadata, DocumentChunk, EngineConfig, EngineError, EngineResult,
        SearchEngine, SearchOptions, SearchProfile, SearchResponse, SearchResult, Strategy,
    };

    pub use crate::{DocumentContext, EmbeddingMode, EnhancementStrategy};
}
