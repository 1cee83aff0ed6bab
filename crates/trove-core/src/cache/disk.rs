//! Disk Cache Tier
//!
//! Content-addressed persistence under the cache root:
//!
//! ```text
//! cache/
//!   embeddings/<sha16>.bin    raw little-endian f32, no header
//!   queries/<sha16>.json
//!   documents/<sha16>.json
//!   contextual/<sha16>.json
//!   manifest.json
//! ```
//!
//! File names are the first 16 hex chars of SHA-256 of the cache key.
//! I/O errors degrade silently: reads behave as misses, writes log and
//! continue. A corrupt manifest discards the warm start, nothing else.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chunk::hex_encode;

use super::CacheClass;

/// Manifest schema version
const MANIFEST_VERSION: u32 = 1;

// ============================================================================
// MANIFEST
// ============================================================================

/// Entry counts recorded in the manifest
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ManifestCounts {
    pub embeddings: usize,
    pub queries: usize,
    pub documents: usize,
    pub contextual: usize,
}

/// A recently-used entry recorded for warm start
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Full cache key
    pub key: String,
    /// Content-addressed file stem (sha16 of the key)
    pub hash: String,
    /// When the entry was recorded
    pub timestamp: DateTime<Utc>,
}

/// Top-level manifest seeding warm start
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub counts: ManifestCounts,
    pub recent_embeddings: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(counts: ManifestCounts, recent_embeddings: Vec<ManifestEntry>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            timestamp: Utc::now(),
            counts,
            recent_embeddings,
        }
    }
}

// ============================================================================
// DISK CACHE
// ============================================================================

/// Content-addressed file stem for a cache key: first 16 hex chars of
/// SHA-256
pub fn key_hash(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    hex_encode(digest.as_slice())[..16].to_string()
}

/// Disk-resident cache tier
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    /// Create against a cache root directory (created on demand)
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The cache root
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn class_dir(&self, class: CacheClass) -> PathBuf {
        self.root.join(class.dir_name())
    }

    fn file_for(&self, class: CacheClass, key: &str) -> PathBuf {
        let ext = match class {
            CacheClass::Embedding => "bin",
            _ => "json",
        };
        self.class_dir(class)
            .join(format!("{}.{}", key_hash(key), ext))
    }

    fn ensure_dir(&self, class: CacheClass) -> bool {
        let dir = self.class_dir(class);
        match std::fs::create_dir_all(&dir) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("cache dir {:?} unavailable: {}", dir, e);
                false
            }
        }
    }

    // ========================================================================
    // EMBEDDINGS (raw little-endian f32)
    // ========================================================================

    /// Write an embedding vector; errors are logged and dropped
    pub fn write_embedding(&self, key: &str, vector: &[f32]) {
        if !self.ensure_dir(CacheClass::Embedding) {
            return;
        }
        let bytes: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();
        let path = self.file_for(CacheClass::Embedding, key);
        if let Err(e) = std::fs::write(&path, bytes) {
            tracing::warn!("cache write failed for {:?}: {}", path, e);
        }
    }

    /// Read an embedding vector; any error is a miss
    pub fn read_embedding(&self, key: &str) -> Option<Vec<f32>> {
        let path = self.file_for(CacheClass::Embedding, key);
        let bytes = std::fs::read(&path).ok()?;
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            tracing::warn!("discarding malformed embedding file {:?}", path);
            return None;
        }
        Some(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    // ========================================================================
    // JSON CLASSES
    // ========================================================================

    /// Write a JSON entry; errors are logged and dropped
    pub fn write_json<T: Serialize>(&self, class: CacheClass, key: &str, value: &T) {
        if !self.ensure_dir(class) {
            return;
        }
        let path = self.file_for(class, key);
        match serde_json::to_vec(value) {
            Ok(payload) => {
                if let Err(e) = std::fs::write(&path, payload) {
                    tracing::warn!("cache write failed for {:?}: {}", path, e);
                }
            }
            Err(e) => tracing::warn!("cache serialization failed for {:?}: {}", path, e),
        }
    }

    /// Read a JSON entry; any error is a miss
    pub fn read_json<T: DeserializeOwned>(&self, class: CacheClass, key: &str) -> Option<T> {
        let path = self.file_for(class, key);
        let payload = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&payload) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("discarding malformed cache file {:?}: {}", path, e);
                None
            }
        }
    }

    /// Remove one entry
    pub fn remove(&self, class: CacheClass, key: &str) {
        let _ = std::fs::remove_file(self.file_for(class, key));
    }

    /// Remove every persisted entry and the manifest
    pub fn clear(&self) {
        for class in [
            CacheClass::Embedding,
            CacheClass::Query,
            CacheClass::Document,
            CacheClass::Contextual,
        ] {
            let _ = std::fs::remove_dir_all(self.class_dir(class));
        }
        let _ = std::fs::remove_file(self.manifest_path());
    }

    /// Count files in a class directory
    pub fn count(&self, class: CacheClass) -> usize {
        std::fs::read_dir(self.class_dir(class))
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .unwrap_or(0)
    }

    // ========================================================================
    // MANIFEST
    // ========================================================================

    fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    /// Write the manifest; errors are logged and dropped
    pub fn write_manifest(&self, manifest: &Manifest) {
        if let Err(e) = std::fs::create_dir_all(&self.root) {
            tracing::warn!("cache root {:?} unavailable: {}", self.root, e);
            return;
        }
        match serde_json::to_vec_pretty(manifest) {
            Ok(payload) => {
                if let Err(e) = std::fs::write(self.manifest_path(), payload) {
                    tracing::warn!("manifest write failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("manifest serialization failed: {}", e),
        }
    }

    /// Read the manifest. A corrupt manifest discards warm start but
    /// preserves empty-cache behavior.
    pub fn read_manifest(&self) -> Option<Manifest> {
        let payload = std::fs::read(self.manifest_path()).ok()?;
        match serde_json::from_slice::<Manifest>(&payload) {
            Ok(manifest) if manifest.version == MANIFEST_VERSION => Some(manifest),
            Ok(manifest) => {
                tracing::warn!(
                    "discarding manifest with unsupported version {}",
                    manifest.version
                );
                None
            }
            Err(e) => {
                tracing::warn!("discarding corrupt manifest: {}", e);
                None
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_cache() -> (tempfile::TempDir, DiskCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path().join("cache"));
        (dir, cache)
    }

    #[test]
    fn test_key_hash_format() {
        let h = key_hash("embedding:m:abc");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
        assert_eq!(h, key_hash("embedding:m:abc"));
    }

    #[test]
    fn test_embedding_round_trip() {
        let (_dir, cache) = temp_cache();
        cache.write_embedding("embedding:k", &[0.25, -1.5, 3.0]);
        let read = cache.read_embedding("embedding:k").unwrap();
        assert_eq!(read, vec![0.25, -1.5, 3.0]);
    }

    #[test]
    fn test_embedding_missing_is_none() {
        let (_dir, cache) = temp_cache();
        assert!(cache.read_embedding("embedding:absent").is_none());
    }

    #[test]
    fn test_malformed_embedding_is_miss() {
        let (_dir, cache) = temp_cache();
        cache.write_embedding("embedding:k", &[1.0]);
        let path = cache.file_for(CacheClass::Embedding, "embedding:k");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        assert!(cache.read_embedding("embedding:k").is_none());
    }

    #[test]
    fn test_json_round_trip() {
        let (_dir, cache) = temp_cache();
        let value = vec!["a".to_string(), "b".to_string()];
        cache.write_json(CacheClass::Query, "query:k", &value);
        let read: Vec<String> = cache.read_json(CacheClass::Query, "query:k").unwrap();
        assert_eq!(read, value);
    }

    #[test]
    fn test_corrupt_json_is_miss() {
        let (_dir, cache) = temp_cache();
        cache.write_json(CacheClass::Document, "doc:k", &42u32);
        let path = cache.file_for(CacheClass::Document, "doc:k");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(cache.read_json::<u32>(CacheClass::Document, "doc:k").is_none());
    }

    #[test]
    fn test_manifest_round_trip() {
        let (_dir, cache) = temp_cache();
        let manifest = Manifest::new(
            ManifestCounts { embeddings: 2, ..Default::default() },
            vec![ManifestEntry {
                key: "embedding:m:x".to_string(),
                hash: key_hash("embedding:m:x"),
                timestamp: Utc::now(),
            }],
        );
        cache.write_manifest(&manifest);

        let read = cache.read_manifest().unwrap();
        assert_eq!(read.counts.embeddings, 2);
        assert_eq!(read.recent_embeddings.len(), 1);
    }

    #[test]
    fn test_corrupt_manifest_is_cold_start() {
        let (_dir, cache) = temp_cache();
        std::fs::create_dir_all(cache.root()).unwrap();
        std::fs::write(cache.root().join("manifest.json"), b"garbage").unwrap();
        assert!(cache.read_manifest().is_none());
    }

    #[test]
    fn test_clear() {
        let (_dir, cache) = temp_cache();
        cache.write_embedding("embedding:k", &[1.0]);
        cache.write_manifest(&Manifest::new(ManifestCounts::default(), vec![]));
        cache.clear();
        assert!(cache.read_embedding("embedding:k").is_none());
        assert!(cache.read_manifest().is_none());
    }
}
