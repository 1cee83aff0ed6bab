//! Test Engine Manager
//!
//! Creates isolated engine instances so tests never interfere with each
//! other or with a real user data directory. Engines are pinned to the
//! deterministic fallback embedding backend and run without the
//! cross-encoder model.

use tempfile::TempDir;
use trove_core::{ChunkInput, EmbeddingMode, EngineConfig, SearchEngine};

/// An engine rooted in a temporary directory
///
/// The directory (database, vector index, cache) is deleted when the value
/// drops.
pub struct TestEngine {
    /// The engine under test
    pub engine: SearchEngine,
    /// Kept alive to prevent premature deletion
    _temp: TempDir,
}

impl TestEngine {
    /// A fresh, empty engine
    pub async fn new() -> Self {
        let temp = TempDir::new().expect("failed to create temp directory");
        let config = EngineConfig {
            data_dir: Some(temp.path().join("data")),
            embedding_model: EmbeddingMode::Fallback,
            enable_reranking: false,
            ..Default::default()
        };
        let engine = SearchEngine::new(config).expect("failed to create engine");
        engine.initialize().await.expect("failed to initialize engine");
        Self {
            engine,
            _temp: temp,
        }
    }

    /// A fresh engine seeded with `(source_id, chunk_index, content)` rows
    pub async fn with_corpus(corpus: &[(&str, i64, &str)]) -> Self {
        let harness = Self::new().await;
        for (source_id, chunk_index, content) in corpus {
            harness
                .engine
                .add_chunk(ChunkInput {
                    source_id: source_id.to_string(),
                    content: content.to_string(),
                    chunk_index: *chunk_index,
                    metadata: Default::default(),
                })
                .await
                .expect("failed to seed chunk");
        }
        harness
    }

    /// The temp data directory path (for reopen-style tests)
    pub fn data_dir(&self) -> std::path::PathBuf {
        self._temp.path().join("data")
    }
}
