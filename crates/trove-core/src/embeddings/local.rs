//! Local Embedding Backend
//!
//! fastembed ONNX inference with a lazily initialized process-wide model.
//! Output (768d nomic-embed-text-v1.5) is Matryoshka-truncated to the
//! engine-wide dimension.

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::{Mutex, OnceLock};

use super::{matryoshka_truncate, Embedding, EmbeddingError};

/// Model id recorded on vectors from this backend (includes the truncated
/// dimension so upgrades are visible to the model-id gate)
pub const MODEL_ID: &str = "nomic-ai/nomic-embed-text-v1.5@384";

/// Result of model initialization, memoized for the process lifetime
static MODEL: OnceLock<Result<Mutex<TextEmbedding>, String>> = OnceLock::new();

/// Model cache directory: `TROVE_MODEL_CACHE` env var, else the platform
/// cache directory, else a dot-directory in the working directory
pub(crate) fn model_cache_dir() -> std::path::PathBuf {
    if let Ok(path) = std::env::var("TROVE_MODEL_CACHE") {
        return std::path::PathBuf::from(path);
    }

    if let Some(proj_dirs) = directories::ProjectDirs::from("io", "trove", "core") {
        return proj_dirs.cache_dir().join("models");
    }

    std::path::PathBuf::from(".trove_models")
}

fn get_model() -> Result<std::sync::MutexGuard<'static, TextEmbedding>, EmbeddingError> {
    let result = MODEL.get_or_init(|| {
        let cache_dir = model_cache_dir();
        if let Err(e) = std::fs::create_dir_all(&cache_dir) {
            tracing::warn!("failed to create model cache directory {:?}: {}", cache_dir, e);
        }

        let options = InitOptions::new(EmbeddingModel::NomicEmbedTextV15)
            .with_show_download_progress(false)
            .with_cache_dir(cache_dir);

        TextEmbedding::try_new(options).map(Mutex::new).map_err(|e| {
            format!(
                "failed to initialize nomic-embed-text-v1.5: {}. \
                 Ensure ONNX runtime is available and model files can be downloaded.",
                e
            )
        })
    });

    match result {
        Ok(model) => model
            .lock()
            .map_err(|e| EmbeddingError::ModelInit(format!("model lock poisoned: {}", e))),
        Err(err) => Err(EmbeddingError::ModelInit(err.clone())),
    }
}

/// True once the model has loaded (does not trigger a download)
pub fn is_loaded() -> bool {
    matches!(MODEL.get(), Some(Ok(_)))
}

/// Embed a batch of texts with the local model
pub fn embed_batch(texts: &[&str]) -> Result<Vec<Embedding>, EmbeddingError> {
    if texts.is_empty() {
        return Ok(vec![]);
    }

    let mut model = get_model()?;

    let embeddings = model
        .embed(texts.to_vec(), None)
        .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?;

    if embeddings.len() != texts.len() {
        return Err(EmbeddingError::EmbeddingFailed(format!(
            "expected {} embeddings, got {}",
            texts.len(),
            embeddings.len()
        )));
    }

    Ok(embeddings
        .into_iter()
        .map(|v| Embedding {
            vector: matryoshka_truncate(v),
            model_id: MODEL_ID.to_string(),
        })
        .collect())
}
