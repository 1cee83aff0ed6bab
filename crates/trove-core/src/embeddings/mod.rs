//! Embedding Provider Module
//!
//! Produces dense vectors for text. Three backends, tried in order:
//! - Local ONNX inference via fastembed (`embeddings` feature)
//! - Remote embedding API (when an API key is configured)
//! - Deterministic character-position hashing fallback
//!
//! The fallback exists so the rest of the engine remains functional without
//! external dependencies. Every vector is tagged with the model id that
//! produced it so vectors from incompatible models are never mixed.

#[cfg(feature = "embeddings")]
mod local;

mod fallback;
mod remote;

pub use fallback::FALLBACK_MODEL_ID;

#[cfg(feature = "embeddings")]
pub(crate) use local::model_cache_dir;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Embedding dimensions used across the engine.
///
/// Local model output (768) is truncated to this prefix (Matryoshka
/// representation learning); the remote API is asked for this dimension
/// directly; the fallback produces it natively.
pub const EMBEDDING_DIMENSIONS: usize = 384;

/// Maximum text length for embedding (truncated if longer)
pub const MAX_TEXT_LENGTH: usize = 8192;

/// Batch size for batch embedding calls
pub const BATCH_SIZE: usize = 32;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Embedding error types
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum EmbeddingError {
    /// Failed to initialize a backend
    ModelInit(String),
    /// A backend call failed
    EmbeddingFailed(String),
    /// Invalid input (empty text)
    InvalidInput(String),
    /// Every backend failed (the fallback cannot fail for non-empty input)
    BackendUnavailable(String),
}

impl std::fmt::Display for EmbeddingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingError::ModelInit(e) => write!(f, "Model initialization failed: {}", e),
            EmbeddingError::EmbeddingFailed(e) => write!(f, "Embedding generation failed: {}", e),
            EmbeddingError::InvalidInput(e) => write!(f, "Invalid input: {}", e),
            EmbeddingError::BackendUnavailable(e) => {
                write!(f, "All embedding backends unavailable: {}", e)
            }
        }
    }
}

impl std::error::Error for EmbeddingError {}

// ============================================================================
// EMBEDDING TYPE
// ============================================================================

/// A dense embedding vector tagged with its producing model
#[derive(Debug, Clone)]
pub struct Embedding {
    /// The L2-normalized embedding vector
    pub vector: Vec<f32>,
    /// Name/version of the model that produced this vector
    pub model_id: String,
}

impl Embedding {
    /// Create an embedding, normalizing the vector to unit length
    pub fn new(mut vector: Vec<f32>, model_id: impl Into<String>) -> Self {
        l2_normalize(&mut vector);
        Self {
            vector,
            model_id: model_id.into(),
        }
    }

    /// Dimensions of the vector
    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }

    /// Cosine similarity with another embedding (0.0 on model/dim mismatch)
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        if self.vector.len() != other.vector.len() {
            return 0.0;
        }
        cosine_similarity(&self.vector, &other.vector)
    }

    /// Serialize as raw little-endian f32 bytes (compact, memory-mappable)
    pub fn to_bytes(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Deserialize from raw little-endian f32 bytes
    pub fn from_bytes(bytes: &[u8], model_id: impl Into<String>) -> Option<Self> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return None;
        }
        let vector: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Some(Self {
            vector,
            model_id: model_id.into(),
        })
    }
}

// ============================================================================
// SIMILARITY FUNCTIONS
// ============================================================================

/// Compute cosine similarity between two vectors
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = (norm_a * norm_b).sqrt();
    if denominator > 0.0 {
        dot / denominator
    } else {
        0.0
    }
}

/// Map a raw cosine value into [0, 1] where downstream expects a
/// probability-like score
#[inline]
pub fn cosine_to_unit(cos: f32) -> f32 {
    ((cos + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// L2-normalize a vector in place
#[inline]
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Truncate a vector to `EMBEDDING_DIMENSIONS` and re-normalize.
///
/// Matryoshka representation learning: the first N dims of a supporting
/// model's output are a valid N-dim embedding.
#[inline]
pub fn matryoshka_truncate(mut vector: Vec<f32>) -> Vec<f32> {
    if vector.len() > EMBEDDING_DIMENSIONS {
        vector.truncate(EMBEDDING_DIMENSIONS);
    }
    l2_normalize(&mut vector);
    vector
}

// ============================================================================
// PROVIDER
// ============================================================================

/// Which backend the provider is pinned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingMode {
    /// Try local, then remote, then fallback
    #[default]
    Auto,
    /// Local ONNX model only (plus fallback if it cannot load)
    Local,
    /// Remote API only (plus fallback if unreachable)
    Remote,
    /// Deterministic fallback only
    Fallback,
}

/// Embedding provider with an ordered backend chain
///
/// All methods take `&self`; the provider is `Send + Sync` and shared by
/// `Arc` across the cache, pipeline and façade.
pub struct EmbeddingProvider {
    mode: EmbeddingMode,
    api_key: RwLock<Option<String>>,
    remote: remote::RemoteBackend,
    /// Set after the local backend has failed once; cleared never (a broken
    /// ONNX runtime does not heal mid-process)
    local_failed: AtomicBool,
    /// Set after the remote backend has failed once; cleared on key rotation
    remote_failed: AtomicBool,
}

impl EmbeddingProvider {
    /// Create a provider with the given mode and optional API key
    pub fn new(mode: EmbeddingMode, api_key: Option<String>) -> Self {
        Self {
            mode,
            api_key: RwLock::new(api_key),
            remote: remote::RemoteBackend::new(),
            local_failed: AtomicBool::new(false),
            remote_failed: AtomicBool::new(false),
        }
    }

    /// The configured backend mode
    pub fn mode(&self) -> EmbeddingMode {
        self.mode
    }

    /// Rotate the API key; re-enables the remote backend
    pub fn set_api_key(&self, key: Option<String>) {
        let mut guard = self.api_key.write().unwrap_or_else(|e| e.into_inner());
        *guard = key;
        self.remote_failed.store(false, Ordering::Relaxed);
    }

    /// Model id the provider would use for the next call
    ///
    /// Useful for gating the vector index on model-id equality before a
    /// batch of inserts.
    pub fn active_model_id(&self) -> String {
        if self.local_available() {
            #[cfg(feature = "embeddings")]
            return local::MODEL_ID.to_string();
        }
        if self.remote_available() {
            return remote::MODEL_ID.to_string();
        }
        FALLBACK_MODEL_ID.to_string()
    }

    /// Generate an embedding for a single text
    pub async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let mut batch = self.embed_batch(&[text]).await?;
        batch
            .pop()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("empty batch result".to_string()))
    }

    /// Generate embeddings for multiple texts
    ///
    /// A whole batch is produced by a single backend so model ids are never
    /// mixed within a call; if the preferred backend fails mid-batch, the
    /// entire batch is retried on the next backend.
    pub async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if let Some(pos) = texts.iter().position(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::InvalidInput(format!(
                "text at index {} is empty",
                pos
            )));
        }

        let truncated: Vec<&str> = texts
            .iter()
            .map(|t| {
                if t.len() > MAX_TEXT_LENGTH {
                    truncate_on_char_boundary(t, MAX_TEXT_LENGTH)
                } else {
                    t
                }
            })
            .collect();

        if self.local_available() {
            #[cfg(feature = "embeddings")]
            match local::embed_batch(&truncated) {
                Ok(embeddings) => return Ok(embeddings),
                Err(e) => {
                    self.local_failed.store(true, Ordering::Relaxed);
                    warn_once_local(&e);
                }
            }
        }

        if self.remote_available() {
            let key = self.current_key().unwrap_or_default();
            match self.remote.embed_batch(&truncated, &key).await {
                Ok(embeddings) => return Ok(embeddings),
                Err(e) => {
                    self.remote_failed.store(true, Ordering::Relaxed);
                    warn_once_remote(&e);
                }
            }
        }

        if self.mode == EmbeddingMode::Local || self.mode == EmbeddingMode::Remote {
            // Pinned backends do not silently degrade to the fallback
            return Err(EmbeddingError::BackendUnavailable(format!(
                "pinned backend {:?} failed",
                self.mode
            )));
        }

        warn_once_fallback();
        truncated
            .iter()
            .map(|t| fallback::embed(t))
            .collect::<Result<Vec<_>, _>>()
    }

    fn current_key(&self) -> Option<String> {
        self.api_key
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn local_available(&self) -> bool {
        #[cfg(feature = "embeddings")]
        {
            matches!(self.mode, EmbeddingMode::Auto | EmbeddingMode::Local)
                && !self.local_failed.load(Ordering::Relaxed)
        }
        #[cfg(not(feature = "embeddings"))]
        {
            false
        }
    }

    fn remote_available(&self) -> bool {
        matches!(self.mode, EmbeddingMode::Auto | EmbeddingMode::Remote)
            && !self.remote_failed.load(Ordering::Relaxed)
            && self.current_key().is_some_and(|k| !k.is_empty())
    }
}

/// Truncate on a char boundary at or below `max_bytes`
fn truncate_on_char_boundary(text: &str, max_bytes: usize) -> &str {
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// Degradation warnings fire once per process so logs stay readable under
// sustained backend outages.

#[cfg(feature = "embeddings")]
fn warn_once_local(err: &EmbeddingError) {
    static ONCE: std::sync::Once = std::sync::Once::new();
    let msg = err.to_string();
    ONCE.call_once(|| {
        tracing::warn!("local embedding backend disabled: {}", msg);
    });
}

fn warn_once_remote(err: &EmbeddingError) {
    static ONCE: std::sync::Once = std::sync::Once::new();
    let msg = err.to_string();
    ONCE.call_once(|| {
        tracing::warn!("remote embedding backend disabled: {}", msg);
    });
}

fn warn_once_fallback() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        tracing::warn!(
            "using deterministic fallback embeddings (model id {}); \
             semantic quality is reduced until a real backend is available",
            FALLBACK_MODEL_ID
        );
    });
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&a, &a);
        assert!((sim - 1.0).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 0.0001);
    }

    #[test]
    fn test_cosine_to_unit_bounds() {
        assert!((cosine_to_unit(1.0) - 1.0).abs() < 0.0001);
        assert!((cosine_to_unit(-1.0)).abs() < 0.0001);
        assert!((cosine_to_unit(0.0) - 0.5).abs() < 0.0001);
    }

    #[test]
    fn test_embedding_normalized_on_construction() {
        let emb = Embedding::new(vec![3.0, 4.0], "test-model");
        let norm: f32 = emb.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_embedding_bytes_round_trip() {
        let original = Embedding::new(vec![0.1, 0.2, 0.3, 0.4], "m");
        let restored = Embedding::from_bytes(&original.to_bytes(), "m").unwrap();
        assert_eq!(original.vector.len(), restored.vector.len());
        for (a, b) in original.vector.iter().zip(restored.vector.iter()) {
            assert!((a - b).abs() < 0.0001);
        }
    }

    #[test]
    fn test_from_bytes_rejects_ragged_input() {
        assert!(Embedding::from_bytes(&[1, 2, 3], "m").is_none());
        assert!(Embedding::from_bytes(&[], "m").is_none());
    }

    #[test]
    fn test_matryoshka_truncate() {
        let long: Vec<f32> = (0..768).map(|i| i as f32).collect();
        let truncated = matryoshka_truncate(long);
        assert_eq!(truncated.len(), EMBEDDING_DIMENSIONS);
        let norm: f32 = truncated.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        let s = "héllo";
        // 'é' is two bytes starting at index 1; index 2 is mid-char
        let t = truncate_on_char_boundary(s, 2);
        assert_eq!(t, "h");
    }

    #[tokio::test]
    async fn test_fallback_mode_embeds_deterministically() {
        let provider = EmbeddingProvider::new(EmbeddingMode::Fallback, None);
        let a = provider.embed("hello world").await.unwrap();
        let b = provider.embed("hello world").await.unwrap();
        assert_eq!(a.model_id, FALLBACK_MODEL_ID);
        assert_eq!(a.vector, b.vector);
        assert_eq!(a.dimensions(), EMBEDDING_DIMENSIONS);
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let provider = EmbeddingProvider::new(EmbeddingMode::Fallback, None);
        let result = provider.embed("   ").await;
        assert!(matches!(result, Err(EmbeddingError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_batch_shares_model_id() {
        let provider = EmbeddingProvider::new(EmbeddingMode::Fallback, None);
        let batch = provider.embed_batch(&["one", "two", "three"]).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert!(batch.iter().all(|e| e.model_id == batch[0].model_id));
    }
}
