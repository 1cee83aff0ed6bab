//! Vector Index
//!
//! HNSW (Hierarchical Navigable Small World) nearest-neighbor search over
//! chunk embeddings, backed by USearch.
//!
//! Features:
//! - Cosine similarity, sub-millisecond queries
//! - Incremental updates, persistence to disk
//! - Model-id gate: vectors from incompatible embedding models are rejected
//!   rather than silently mixed

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::embeddings::EMBEDDING_DIMENSIONS;

// ============================================================================
// CONSTANTS
// ============================================================================

/// HNSW connectivity parameter (higher = better recall, more memory)
pub const DEFAULT_CONNECTIVITY: usize = 16;

/// HNSW expansion factor for index building
pub const DEFAULT_EXPANSION_ADD: usize = 128;

/// HNSW expansion factor for search
pub const DEFAULT_EXPANSION_SEARCH: usize = 64;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vector index error types
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum VectorIndexError {
    /// Failed to create the index
    IndexCreation(String),
    /// Failed to add a vector
    IndexAdd(String),
    /// Failed to search
    IndexSearch(String),
    /// Failed to persist/load the index
    IndexPersistence(String),
    /// Dimension mismatch (expected, got)
    InvalidDimensions(usize, usize),
    /// Vector produced by a model incompatible with the resident one
    ModelMismatch { resident: String, offered: String },
}

impl std::fmt::Display for VectorIndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorIndexError::IndexCreation(e) => write!(f, "Index creation failed: {}", e),
            VectorIndexError::IndexAdd(e) => write!(f, "Failed to add vector: {}", e),
            VectorIndexError::IndexSearch(e) => write!(f, "Search failed: {}", e),
            VectorIndexError::IndexPersistence(e) => write!(f, "Persistence failed: {}", e),
            VectorIndexError::InvalidDimensions(expected, got) => {
                write!(f, "Invalid dimensions: expected {}, got {}", expected, got)
            }
            VectorIndexError::ModelMismatch { resident, offered } => write!(
                f,
                "Embedding model mismatch: index holds {}, offered {}",
                resident, offered
            ),
        }
    }
}

impl std::error::Error for VectorIndexError {}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the vector index
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    /// Number of dimensions
    pub dimensions: usize,
    /// HNSW connectivity parameter
    pub connectivity: usize,
    /// Expansion factor for adding vectors
    pub expansion_add: usize,
    /// Expansion factor for searching
    pub expansion_search: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            dimensions: EMBEDDING_DIMENSIONS,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
        }
    }
}

/// Index statistics
#[derive(Debug, Clone)]
pub struct VectorIndexStats {
    /// Total number of vectors
    pub total_vectors: usize,
    /// Vector dimensions
    pub dimensions: usize,
    /// Embedding model resident in the index
    pub model_id: Option<String>,
    /// Estimated memory usage in bytes
    pub memory_bytes: usize,
}

// ============================================================================
// METADATA & HITS
// ============================================================================

/// Per-vector metadata stored alongside the index
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VectorMeta {
    /// Source document the chunk belongs to
    pub source_id: Option<String>,
}

/// A nearest-neighbor hit
#[derive(Debug, Clone)]
pub struct VectorHit {
    /// Chunk id
    pub id: String,
    /// Stored metadata
    pub meta: VectorMeta,
    /// Raw cosine similarity in [-1, 1]. Use
    /// [`crate::embeddings::cosine_to_unit`] where a probability-like value
    /// is expected.
    pub similarity: f32,
}

/// Sidecar file payload persisted next to the USearch index
#[derive(Serialize, Deserialize)]
struct Sidecar {
    key_to_id: HashMap<String, u64>,
    meta: HashMap<String, VectorMeta>,
    model_id: Option<String>,
    next_id: u64,
}

// ============================================================================
// VECTOR INDEX
// ============================================================================

/// HNSW vector index over `(chunk id, vector, metadata)` triples
pub struct VectorIndex {
    index: Index,
    config: VectorIndexConfig,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    meta: HashMap<String, VectorMeta>,
    model_id: Option<String>,
    next_id: u64,
}

impl VectorIndex {
    /// Create a new index with default configuration
    pub fn new() -> Result<Self, VectorIndexError> {
        Self::with_config(VectorIndexConfig::default())
    }

    /// Create a new index with custom configuration
    pub fn with_config(config: VectorIndexConfig) -> Result<Self, VectorIndexError> {
        let index = Index::new(&Self::options(&config))
            .map_err(|e| VectorIndexError::IndexCreation(e.to_string()))?;

        Ok(Self {
            index,
            config,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            meta: HashMap::new(),
            model_id: None,
            next_id: 0,
        })
    }

    fn options(config: &VectorIndexConfig) -> IndexOptions {
        IndexOptions {
            dimensions: config.dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: config.connectivity,
            expansion_add: config.expansion_add,
            expansion_search: config.expansion_search,
            multi: false,
        }
    }

    /// Number of vectors in the index
    pub fn len(&self) -> usize {
        self.index.size()
    }

    /// Whether the index is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vector dimensions
    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    /// Embedding model resident in the index, if any vectors are stored
    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    /// Whether a chunk id is present
    pub fn contains(&self, id: &str) -> bool {
        self.key_to_id.contains_key(id)
    }

    /// Insert or update a vector for a chunk id.
    ///
    /// The first insert fixes the index's resident model id; later inserts
    /// with a different model id are rejected so similarity math never mixes
    /// incompatible vector spaces. Rebuild the index to switch models.
    pub fn insert(
        &mut self,
        id: &str,
        vector: &[f32],
        model_id: &str,
        meta: VectorMeta,
    ) -> Result<(), VectorIndexError> {
        if vector.len() != self.config.dimensions {
            return Err(VectorIndexError::InvalidDimensions(
                self.config.dimensions,
                vector.len(),
            ));
        }

        match &self.model_id {
            Some(resident) if resident != model_id => {
                return Err(VectorIndexError::ModelMismatch {
                    resident: resident.clone(),
                    offered: model_id.to_string(),
                });
            }
            Some(_) => {}
            None => self.model_id = Some(model_id.to_string()),
        }

        if let Some(&existing) = self.key_to_id.get(id) {
            self.index
                .remove(existing)
                .map_err(|e| VectorIndexError::IndexAdd(e.to_string()))?;
            self.reserve(self.index.size() + 1)?;
            self.index
                .add(existing, vector)
                .map_err(|e| VectorIndexError::IndexAdd(e.to_string()))?;
            self.meta.insert(id.to_string(), meta);
            return Ok(());
        }

        // usearch requires reserve() before add()
        let capacity = self.index.capacity();
        let size = self.index.size();
        if size >= capacity {
            let new_capacity = std::cmp::max(capacity * 2, 16);
            self.reserve(new_capacity)?;
        }

        let numeric = self.next_id;
        self.next_id += 1;

        self.index
            .add(numeric, vector)
            .map_err(|e| VectorIndexError::IndexAdd(e.to_string()))?;

        self.key_to_id.insert(id.to_string(), numeric);
        self.id_to_key.insert(numeric, id.to_string());
        self.meta.insert(id.to_string(), meta);

        Ok(())
    }

    /// Insert a batch of vectors; the whole batch must share a model id
    pub fn insert_batch(
        &mut self,
        entries: &[(String, Vec<f32>, VectorMeta)],
        model_id: &str,
    ) -> Result<(), VectorIndexError> {
        self.reserve(self.index.size() + entries.len())?;
        for (id, vector, meta) in entries {
            self.insert(id, vector, model_id, meta.clone())?;
        }
        Ok(())
    }

    /// Remove a vector by chunk id; returns whether it existed
    pub fn delete(&mut self, id: &str) -> Result<bool, VectorIndexError> {
        if let Some(numeric) = self.key_to_id.remove(id) {
            self.id_to_key.remove(&numeric);
            self.meta.remove(id);
            self.index
                .remove(numeric)
                .map_err(|e| VectorIndexError::IndexAdd(e.to_string()))?;
            if self.key_to_id.is_empty() {
                self.model_id = None;
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Nearest-neighbor query, sorted by descending cosine similarity
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>, VectorIndexError> {
        if vector.len() != self.config.dimensions {
            return Err(VectorIndexError::InvalidDimensions(
                self.config.dimensions,
                vector.len(),
            ));
        }

        if self.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        let matches = self
            .index
            .search(vector, k)
            .map_err(|e| VectorIndexError::IndexSearch(e.to_string()))?;

        let mut hits = Vec::with_capacity(matches.keys.len());
        for (numeric, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            if let Some(id) = self.id_to_key.get(numeric) {
                hits.push(VectorHit {
                    id: id.clone(),
                    meta: self.meta.get(id).cloned().unwrap_or_default(),
                    // usearch cosine distance = 1 - cosine similarity
                    similarity: 1.0 - distance,
                });
            }
        }

        Ok(hits)
    }

    /// Query with a minimum similarity threshold
    pub fn query_with_threshold(
        &self,
        vector: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<VectorHit>, VectorIndexError> {
        let hits = self.query(vector, k)?;
        Ok(hits
            .into_iter()
            .filter(|h| h.similarity >= min_similarity)
            .collect())
    }

    /// Drop all vectors, keeping configuration (used by rebuild)
    pub fn clear(&mut self) -> Result<(), VectorIndexError> {
        self.index = Index::new(&Self::options(&self.config))
            .map_err(|e| VectorIndexError::IndexCreation(e.to_string()))?;
        self.key_to_id.clear();
        self.id_to_key.clear();
        self.meta.clear();
        self.model_id = None;
        self.next_id = 0;
        Ok(())
    }

    fn reserve(&self, capacity: usize) -> Result<(), VectorIndexError> {
        self.index
            .reserve(capacity)
            .map_err(|e| VectorIndexError::IndexCreation(format!("reserve failed: {}", e)))
    }

    /// Save the index and its sidecar mappings to disk
    pub fn save(&self, path: &Path) -> Result<(), VectorIndexError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| VectorIndexError::IndexPersistence("invalid path".to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VectorIndexError::IndexPersistence(e.to_string()))?;
        }

        self.index
            .save(path_str)
            .map_err(|e| VectorIndexError::IndexPersistence(e.to_string()))?;

        let sidecar = Sidecar {
            key_to_id: self.key_to_id.clone(),
            meta: self.meta.clone(),
            model_id: self.model_id.clone(),
            next_id: self.next_id,
        };
        let sidecar_path = path.with_extension("mappings.json");
        let payload = serde_json::to_string(&sidecar)
            .map_err(|e| VectorIndexError::IndexPersistence(e.to_string()))?;
        std::fs::write(&sidecar_path, payload)
            .map_err(|e| VectorIndexError::IndexPersistence(e.to_string()))?;

        Ok(())
    }

    /// Load an index previously written by [`VectorIndex::save`].
    ///
    /// Corruption here is recoverable: callers fall back to a rebuild from
    /// the chunk store's embedding rows.
    pub fn load(path: &Path, config: VectorIndexConfig) -> Result<Self, VectorIndexError> {
        let path_str = path
            .to_str()
            .ok_or_else(|| VectorIndexError::IndexPersistence("invalid path".to_string()))?;

        let index = Index::new(&Self::options(&config))
            .map_err(|e| VectorIndexError::IndexCreation(e.to_string()))?;
        index
            .load(path_str)
            .map_err(|e| VectorIndexError::IndexPersistence(e.to_string()))?;

        let sidecar_path = path.with_extension("mappings.json");
        let payload = std::fs::read_to_string(&sidecar_path)
            .map_err(|e| VectorIndexError::IndexPersistence(e.to_string()))?;
        let sidecar: Sidecar = serde_json::from_str(&payload)
            .map_err(|e| VectorIndexError::IndexPersistence(e.to_string()))?;

        let id_to_key: HashMap<u64, String> = sidecar
            .key_to_id
            .iter()
            .map(|(k, &v)| (v, k.clone()))
            .collect();

        Ok(Self {
            index,
            config,
            key_to_id: sidecar.key_to_id,
            id_to_key,
            meta: sidecar.meta,
            model_id: sidecar.model_id,
            next_id: sidecar.next_id,
        })
    }

    /// Index statistics
    pub fn stats(&self) -> VectorIndexStats {
        VectorIndexStats {
            total_vectors: self.len(),
            dimensions: self.config.dimensions,
            model_id: self.model_id.clone(),
            memory_bytes: self.index.serialized_length(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = "test-model-v1";

    fn test_vector(seed: f32) -> Vec<f32> {
        let mut v: Vec<f32> = (0..EMBEDDING_DIMENSIONS)
            .map(|i| ((i as f32 + seed) / EMBEDDING_DIMENSIONS as f32).sin())
            .collect();
        crate::embeddings::l2_normalize(&mut v);
        v
    }

    #[test]
    fn test_insert_and_query() {
        let mut index = VectorIndex::new().unwrap();

        index.insert("c1", &test_vector(1.0), MODEL, VectorMeta::default()).unwrap();
        index.insert("c2", &test_vector(2.0), MODEL, VectorMeta::default()).unwrap();
        index.insert("c3", &test_vector(90.0), MODEL, VectorMeta::default()).unwrap();

        assert_eq!(index.len(), 3);
        assert!(index.contains("c1"));

        let hits = index.query(&test_vector(1.0), 3).unwrap();
        assert_eq!(hits[0].id, "c1");
        assert!(hits[0].similarity > 0.99);
    }

    #[test]
    fn test_model_mismatch_rejected() {
        let mut index = VectorIndex::new().unwrap();
        index.insert("c1", &test_vector(1.0), MODEL, VectorMeta::default()).unwrap();

        let result = index.insert("c2", &test_vector(2.0), "other-model", VectorMeta::default());
        assert!(matches!(result, Err(VectorIndexError::ModelMismatch { .. })));
    }

    #[test]
    fn test_model_resets_after_clear() {
        let mut index = VectorIndex::new().unwrap();
        index.insert("c1", &test_vector(1.0), MODEL, VectorMeta::default()).unwrap();
        index.clear().unwrap();
        assert!(index.model_id().is_none());
        index.insert("c1", &test_vector(1.0), "other-model", VectorMeta::default()).unwrap();
        assert_eq!(index.model_id(), Some("other-model"));
    }

    #[test]
    fn test_invalid_dimensions() {
        let mut index = VectorIndex::new().unwrap();
        let result = index.insert("c1", &[1.0, 2.0], MODEL, VectorMeta::default());
        assert!(matches!(result, Err(VectorIndexError::InvalidDimensions(_, _))));
    }

    #[test]
    fn test_update_existing() {
        let mut index = VectorIndex::new().unwrap();
        index.insert("c1", &test_vector(1.0), MODEL, VectorMeta::default()).unwrap();
        index.insert("c1", &test_vector(2.0), MODEL, VectorMeta::default()).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_delete() {
        let mut index = VectorIndex::new().unwrap();
        index.insert("c1", &test_vector(1.0), MODEL, VectorMeta::default()).unwrap();
        assert!(index.delete("c1").unwrap());
        assert!(!index.delete("c1").unwrap());
        assert!(!index.contains("c1"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vectors.usearch");

        let mut index = VectorIndex::new().unwrap();
        index
            .insert(
                "c1",
                &test_vector(1.0),
                MODEL,
                VectorMeta { source_id: Some("s1".into()) },
            )
            .unwrap();
        index.save(&path).unwrap();

        let loaded = VectorIndex::load(&path, VectorIndexConfig::default()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.model_id(), Some(MODEL));

        let hits = loaded.query(&test_vector(1.0), 1).unwrap();
        assert_eq!(hits[0].id, "c1");
        assert_eq!(hits[0].meta.source_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_load_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = VectorIndex::load(&dir.path().join("absent.usearch"), VectorIndexConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_query_with_threshold() {
        let mut index = VectorIndex::new().unwrap();
        index.insert("near", &test_vector(1.0), MODEL, VectorMeta::default()).unwrap();
        index.insert("far", &test_vector(200.0), MODEL, VectorMeta::default()).unwrap();

        let hits = index.query_with_threshold(&test_vector(1.0), 10, 0.95).unwrap();
        assert!(hits.iter().any(|h| h.id == "near"));
        assert!(hits.iter().all(|h| h.similarity >= 0.95));
    }
}
