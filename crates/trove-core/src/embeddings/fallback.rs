//! Deterministic Fallback Embeddings
//!
//! Character-position hashing projected into a fixed-dimensional unit
//! vector. Not semantically meaningful the way a learned model is, but
//! deterministic, dependency-free, and stable across runs, which keeps the
//! whole engine functional when no model backend is reachable.
//!
//! Consumers can detect (and downweight or rebuild) fallback vectors by the
//! distinct model id.

use super::{l2_normalize, Embedding, EmbeddingError, EMBEDDING_DIMENSIONS};

/// Model id tag for fallback vectors
pub const FALLBACK_MODEL_ID: &str = "fallback-charhash-384-v1";

/// Produce a deterministic embedding for non-empty text.
///
/// Identical input yields byte-identical output.
pub fn embed(text: &str) -> Result<Embedding, EmbeddingError> {
    if text.trim().is_empty() {
        return Err(EmbeddingError::InvalidInput(
            "text cannot be empty".to_string(),
        ));
    }

    let mut vector = vec![0.0f32; EMBEDDING_DIMENSIONS];

    // Unigram features: each (char, position-bucket) pair scatters into one
    // dimension with a sign bit, so anagrams land on different vectors.
    for (pos, ch) in text.chars().enumerate() {
        let h = mix(ch as u64, (pos % 16) as u64);
        let dim = (h % EMBEDDING_DIMENSIONS as u64) as usize;
        let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
        vector[dim] += sign;
    }

    // Word features: whole-token hashes give overlap between texts sharing
    // vocabulary regardless of position.
    for word in text.split_whitespace() {
        let mut h = 0xcbf2_9ce4_8422_2325u64;
        for ch in word.to_lowercase().chars() {
            h = mix(h, ch as u64);
        }
        let dim = (h % EMBEDDING_DIMENSIONS as u64) as usize;
        let sign = if (h >> 33) & 1 == 0 { 1.0 } else { -1.0 };
        vector[dim] += sign * 2.0;
    }

    l2_normalize(&mut vector);
    Ok(Embedding {
        vector,
        model_id: FALLBACK_MODEL_ID.to_string(),
    })
}

/// splitmix64-style mixer; the only requirement is determinism
#[inline]
fn mix(a: u64, b: u64) -> u64 {
    let mut z = a
        .wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(b)
        .wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
