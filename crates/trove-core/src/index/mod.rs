//! Index Module
//!
//! The two search substrates:
//! - Vector index: HNSW (USearch) nearest-neighbor over chunk embeddings
//! - Keyword index: SQLite FTS5 inverted index with BM25 ranking

mod keyword;
mod vector;

pub use keyword::{sanitize_fts_query, KeywordFilters, KeywordHit, KeywordIndex};

pub use vector::{
    VectorHit, VectorIndex, VectorIndexConfig, VectorIndexError, VectorIndexStats, VectorMeta,
    DEFAULT_CONNECTIVITY,
};
