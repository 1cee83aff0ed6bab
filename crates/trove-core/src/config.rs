//! Engine Configuration
//!
//! Process-long configuration for the search engine, plus the on-disk
//! layout of the per-user data directory:
//!
//! ```text
//! <data dir>/
//!   docs.db        chunk store, keyword index, embedding rows
//!   vectors/       vector index + mappings sidecar
//!   cache/         multi-tier cache (embeddings/, queries/, documents/,
//!                  contextual/, manifest.json)
//!   models/        reranker and embedding model weights
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::embeddings::EmbeddingMode;
use crate::enhance::EnhancementStrategy;
use crate::pipeline::SearchProfile;

// ============================================================================
// DATA LAYOUT
// ============================================================================

/// Resolved paths under the per-user data directory
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    /// Layout rooted at an explicit directory
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Layout rooted at the platform data directory
    pub fn default_location() -> Option<Self> {
        directories::ProjectDirs::from("io", "trove", "core")
            .map(|dirs| Self::new(dirs.data_dir().to_path_buf()))
    }

    /// The data root
    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// Chunk store database
    pub fn docs_db(&self) -> PathBuf {
        self.root.join("docs.db")
    }

    /// Vector index file
    pub fn vector_index(&self) -> PathBuf {
        self.root.join("vectors").join("index.usearch")
    }

    /// Cache root
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Model weights directory
    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }
}

// ============================================================================
// CONFIG
// ============================================================================

/// Engine configuration keys
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Data directory; the platform default applies when unset
    pub data_dir: Option<PathBuf>,
    /// Default pipeline profile for `search()`
    pub search_profile: SearchProfile,
    /// Load and use the cross-encoder reranker
    pub enable_reranking: bool,
    /// Use the contextual enhancer in pipelines
    pub enable_contextual: bool,
    /// Embedding backend selection
    pub embedding_model: EmbeddingMode,
    /// Enhancement strategy for the contextual enhancer
    pub enhancement_strategy: EnhancementStrategy,
    /// API key shared by the remote embedding and generative backends
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Model cache directory override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_cache_dir: Option<PathBuf>,
    /// Cache memory pressure above which expired entries are swept
    pub auto_cleanup_threshold: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            search_profile: SearchProfile::Balanced,
            enable_reranking: true,
            enable_contextual: true,
            embedding_model: EmbeddingMode::Auto,
            enhancement_strategy: EnhancementStrategy::Expand,
            api_key: None,
            model_cache_dir: None,
            auto_cleanup_threshold: 0.8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.search_profile, SearchProfile::Balanced);
        assert!(config.enable_reranking);
        assert!(config.enable_contextual);
        assert_eq!(config.embedding_model, EmbeddingMode::Auto);
        assert!((config.auto_cleanup_threshold - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_layout_paths() {
        let layout = DataLayout::new(PathBuf::from("/tmp/trove"));
        assert!(layout.docs_db().ends_with("docs.db"));
        assert!(layout.vector_index().ends_with("vectors/index.usearch"));
        assert!(layout.cache_dir().ends_with("cache"));
        assert!(layout.models_dir().ends_with("models"));
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = EngineConfig {
            search_profile: SearchProfile::Accurate,
            enable_reranking: false,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.search_profile, SearchProfile::Accurate);
        assert!(!parsed.enable_reranking);
    }
}
