//! Multi-Tier Cache
//!
//! Three lookup tiers over typed value classes:
//!
//! - **T1**: bounded in-memory LRU per value class (embeddings, query result
//!   lists, document payloads, contextual enhancements)
//! - **T2**: disk persistence, content-addressed files plus a manifest
//! - **T3**: semantic near-hit matching for query-class entries — a cached
//!   query's results are served for a *different* query when their
//!   embeddings' cosine similarity clears a high threshold (default 0.95)
//!
//! Concurrent `get_or_compute` calls with the same key coalesce through a
//! single-flight wait-map: one compute runs, other callers await its result.
//!
//! Disk I/O errors degrade silently: read errors behave as misses, write
//! errors log and continue. Nothing in this module surfaces an I/O error.

mod disk;
mod flight;
mod tier;

pub use disk::{key_hash, DiskCache, Manifest, ManifestCounts, ManifestEntry};
pub use flight::SingleFlight;
pub use tier::{CacheValue, MemoryTier, TierConfig, TierEntry};

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunk::{DocumentChunk, SearchResult};
use crate::embeddings::EmbeddingProvider;
use crate::enhance::EnhancedText;

// ============================================================================
// VALUE CLASS
// ============================================================================

/// Typed cache key prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheClass {
    /// `embedding:` keys — dense vectors, persisted as raw f32
    Embedding,
    /// `query:` keys — ranked result lists, near-hit eligible
    Query,
    /// `doc:` keys — document chunk payloads
    Document,
    /// `contextual:` keys — enhancement results, long TTL, persisted
    Contextual,
}

impl CacheClass {
    /// Key prefix including the colon
    pub fn prefix(&self) -> &'static str {
        match self {
            CacheClass::Embedding => "embedding:",
            CacheClass::Query => "query:",
            CacheClass::Document => "doc:",
            CacheClass::Contextual => "contextual:",
        }
    }

    /// Directory name under the cache root
    pub fn dir_name(&self) -> &'static str {
        match self {
            CacheClass::Embedding => "embeddings",
            CacheClass::Query => "queries",
            CacheClass::Document => "documents",
            CacheClass::Contextual => "contextual",
        }
    }

    /// Classify a key by its typed prefix
    pub fn from_key(key: &str) -> Option<Self> {
        [
            CacheClass::Embedding,
            CacheClass::Query,
            CacheClass::Document,
            CacheClass::Contextual,
        ]
        .into_iter()
        .find(|class| key.starts_with(class.prefix()))
    }
}

// ============================================================================
// KEY CONSTRUCTORS
// ============================================================================

/// Cache key for a text embedding under a specific model
pub fn embedding_key(model_id: &str, text: &str) -> String {
    format!("embedding:{}:{}", model_id, key_hash(text))
}

/// Cache key for a query's result list
pub fn query_key(profile: &str, limit: usize, query: &str) -> String {
    format!("query:{}:{}:{}", profile, limit, key_hash(query))
}

/// Cache key for a document chunk payload
pub fn doc_key(chunk_id: &str) -> String {
    format!("doc:{}", chunk_id)
}

/// Cache key for a contextual enhancement result
pub fn contextual_key(text: &str, context_fingerprint: &str) -> String {
    format!(
        "contextual:{}:{}",
        key_hash(text),
        key_hash(context_fingerprint)
    )
}

// ============================================================================
// OPTIONS & CONFIG
// ============================================================================

/// Per-call cache options
#[derive(Debug, Clone)]
pub struct CacheOpts {
    /// Entry TTL; the tier default applies when unset
    pub ttl: Option<Duration>,
    /// Allow serving a semantic near-hit (query keys only)
    pub allow_semantic: bool,
    /// Persist to the disk tier
    pub persist: bool,
    /// Compression level 0-9 for persisted entries. Recorded for the on-disk
    /// format; only 0 (uncompressed) is currently written.
    pub compression_level: u8,
}

impl Default for CacheOpts {
    fn default() -> Self {
        Self {
            ttl: None,
            allow_semantic: true,
            persist: false,
            compression_level: 0,
        }
    }
}

/// Cache configuration with the documented default sizes and TTLs
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache root directory
    pub root: PathBuf,
    /// Embedding tier bounds (default 10k entries / 100 MB / 24 h)
    pub embedding_tier: TierConfig,
    /// Query-result tier bounds (default 1k entries / 50 MB / 5 min)
    pub query_tier: TierConfig,
    /// Document tier bounds (default 5k entries / 200 MB / 30 min)
    pub document_tier: TierConfig,
    /// Contextual-enhancement tier bounds (default 1k entries / 20 MB / 24 h)
    pub contextual_tier: TierConfig,
    /// Minimum cosine similarity for a semantic near-hit. Tunable; requires
    /// measured calibration per embedding model.
    pub semantic_threshold: f32,
    /// Background flush interval
    pub flush_interval: Duration,
    /// Manifest recent-entries cap
    pub manifest_cap: usize,
}

impl CacheConfig {
    /// Defaults rooted at the given cache directory
    pub fn new(root: PathBuf) -> Self {
        const MB: usize = 1024 * 1024;
        Self {
            root,
            embedding_tier: TierConfig::new(10_000, 100 * MB, Duration::from_secs(24 * 3600)),
            query_tier: TierConfig::new(1_000, 50 * MB, Duration::from_secs(5 * 60)),
            document_tier: TierConfig::new(5_000, 200 * MB, Duration::from_secs(30 * 60)),
            contextual_tier: TierConfig::new(1_000, 20 * MB, Duration::from_secs(24 * 3600)),
            semantic_threshold: 0.95,
            flush_interval: Duration::from_secs(5 * 60),
            manifest_cap: 1_000,
        }
    }
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Atomic cache counters
#[derive(Debug, Default)]
pub struct CacheStatistics {
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    disk_hits: AtomicU64,
    disk_misses: AtomicU64,
    semantic_hits: AtomicU64,
    total_queries: AtomicU64,
    evictions: AtomicU64,
}

/// A point-in-time snapshot of the cache counters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub disk_hits: u64,
    pub disk_misses: u64,
    pub semantic_hits: u64,
    pub total_queries: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups answered from any tier
    pub fn hit_rate(&self) -> f64 {
        if self.total_queries == 0 {
            return 0.0;
        }
        let hits = self.memory_hits + self.disk_hits + self.semantic_hits;
        hits as f64 / self.total_queries as f64
    }
}

impl CacheStatistics {
    fn snapshot(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            memory_misses: self.memory_misses.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            disk_misses: self.disk_misses.load(Ordering::Relaxed),
            semantic_hits: self.semantic_hits.load(Ordering::Relaxed),
            total_queries: self.total_queries.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.memory_hits.store(0, Ordering::Relaxed);
        self.memory_misses.store(0, Ordering::Relaxed);
        self.disk_hits.store(0, Ordering::Relaxed);
        self.disk_misses.store(0, Ordering::Relaxed);
        self.semantic_hits.store(0, Ordering::Relaxed);
        self.total_queries.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

// ============================================================================
// VALUE IMPLS
// ============================================================================

impl CacheValue for Vec<SearchResult> {
    fn byte_size(&self) -> usize {
        self.iter().map(SearchResult::payload_bytes).sum()
    }
}

impl CacheValue for DocumentChunk {
    fn byte_size(&self) -> usize {
        self.payload_bytes()
    }
}

impl CacheValue for EnhancedText {
    fn byte_size(&self) -> usize {
        self.payload_bytes()
    }
}

/// How a query lookup was answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheHitKind {
    /// Served from the in-memory tier
    Memory,
    /// Promoted from the disk tier
    Disk,
    /// Served from a different query's entry via near-hit matching
    Semantic,
    /// Computed fresh
    Miss,
}

impl CacheHitKind {
    /// Whether any tier answered without running the compute
    pub fn is_hit(&self) -> bool {
        !matches!(self, CacheHitKind::Miss)
    }
}

/// Disk payload for query-class entries; carries the query embedding so
/// promoted entries stay near-hit eligible
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedQuery {
    results: Vec<SearchResult>,
    embedding: Option<Vec<f32>>,
}

// ============================================================================
// MULTI-TIER CACHE
// ============================================================================

/// The multi-tier cache
pub struct MultiTierCache {
    config: CacheConfig,
    embeddings: MemoryTier<Vec<f32>>,
    queries: MemoryTier<Vec<SearchResult>>,
    documents: MemoryTier<DocumentChunk>,
    contextual: MemoryTier<EnhancedText>,
    disk: DiskCache,
    flight_embeddings: SingleFlight<Vec<f32>>,
    flight_queries: SingleFlight<(Vec<SearchResult>, CacheHitKind)>,
    flight_documents: SingleFlight<DocumentChunk>,
    flight_contextual: SingleFlight<EnhancedText>,
    stats: CacheStatistics,
    dirty: Mutex<HashSet<(CacheClass, String)>>,
}

impl MultiTierCache {
    /// Create a cache with the given configuration
    pub fn new(config: CacheConfig) -> Self {
        let disk = DiskCache::new(config.root.clone());
        Self {
            embeddings: MemoryTier::new(config.embedding_tier.clone()),
            queries: MemoryTier::new(config.query_tier.clone()),
            documents: MemoryTier::new(config.document_tier.clone()),
            contextual: MemoryTier::new(config.contextual_tier.clone()),
            disk,
            flight_embeddings: SingleFlight::new(),
            flight_queries: SingleFlight::new(),
            flight_documents: SingleFlight::new(),
            flight_contextual: SingleFlight::new(),
            stats: CacheStatistics::default(),
            dirty: Mutex::new(HashSet::new()),
            config,
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn mark_dirty(&self, class: CacheClass, key: &str) {
        let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
        dirty.insert((class, key.to_string()));
    }

    // ========================================================================
    // EMBEDDING CLASS
    // ========================================================================

    /// Get or compute an embedding vector.
    ///
    /// Near-hit matching never applies to `embedding:` keys.
    pub async fn get_or_compute_embedding<E, F, Fut>(
        &self,
        key: &str,
        opts: &CacheOpts,
        compute: F,
    ) -> Result<Vec<f32>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<f32>, E>>,
    {
        self.stats.total_queries.fetch_add(1, Ordering::Relaxed);

        if let Some(vector) = self.embeddings.get(key) {
            self.stats.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(vector);
        }
        self.stats.memory_misses.fetch_add(1, Ordering::Relaxed);

        let opts = opts.clone();
        self.flight_embeddings
            .run(key, || async move {
                if let Some(vector) = self.embeddings.get(key) {
                    return Ok(vector);
                }

                if opts.persist {
                    if let Some(vector) = self.disk.read_embedding(key) {
                        self.stats.disk_hits.fetch_add(1, Ordering::Relaxed);
                        let evicted = self.embeddings.put(key, vector.clone(), opts.ttl, None);
                        self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                        return Ok(vector);
                    }
                    self.stats.disk_misses.fetch_add(1, Ordering::Relaxed);
                }

                let vector = compute().await?;
                let evicted = self.embeddings.put(key, vector.clone(), opts.ttl, None);
                self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                if opts.persist {
                    self.mark_dirty(CacheClass::Embedding, key);
                }
                Ok(vector)
            })
            .await
    }

    /// Insert an already-computed embedding (precompute pass)
    pub fn prime_embedding(&self, key: &str, vector: Vec<f32>, persist: bool) {
        let evicted = self.embeddings.put(key, vector, None, None);
        self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        if persist {
            self.mark_dirty(CacheClass::Embedding, key);
        }
    }

    // ========================================================================
    // QUERY CLASS
    // ========================================================================

    /// Get or compute a query's result list.
    ///
    /// Lookup order: T1, then (if `persist`) T2 with promotion, then (if
    /// `allow_semantic` and a provider is given) a near-hit scan over cached
    /// query embeddings, then the compute. The provider embeds the live
    /// query text lazily at the near-hit step; that embedding is itself
    /// cached under an `embedding:` key.
    pub async fn get_or_compute_query<E, F, Fut>(
        &self,
        key: &str,
        query_text: &str,
        opts: &CacheOpts,
        provider: Option<&EmbeddingProvider>,
        compute: F,
    ) -> Result<(Vec<SearchResult>, CacheHitKind), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<SearchResult>, E>>,
    {
        self.stats.total_queries.fetch_add(1, Ordering::Relaxed);

        if let Some(results) = self.queries.get(key) {
            self.stats.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Ok((results, CacheHitKind::Memory));
        }
        self.stats.memory_misses.fetch_add(1, Ordering::Relaxed);

        let opts = opts.clone();
        self.flight_queries
            .run(key, || async move {
                if let Some(results) = self.queries.get(key) {
                    return Ok((results, CacheHitKind::Memory));
                }

                if opts.persist {
                    if let Some(persisted) =
                        self.disk.read_json::<PersistedQuery>(CacheClass::Query, key)
                    {
                        self.stats.disk_hits.fetch_add(1, Ordering::Relaxed);
                        let evicted = self.queries.put(
                            key,
                            persisted.results.clone(),
                            opts.ttl,
                            persisted.embedding,
                        );
                        self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                        return Ok((persisted.results, CacheHitKind::Disk));
                    }
                    self.stats.disk_misses.fetch_add(1, Ordering::Relaxed);
                }

                // Semantic near-hit: embed the live query and scan cached
                // query entries. Embedding failures degrade to a plain miss.
                let mut query_embedding: Option<Vec<f32>> = None;
                if opts.allow_semantic {
                    if let Some(provider) = provider {
                        query_embedding = self.embed_for_near_hit(provider, query_text).await;
                        if let Some(embedding) = &query_embedding {
                            if let Some((other_key, results, similarity)) = self
                                .queries
                                .best_semantic_match(embedding, self.config.semantic_threshold)
                            {
                                self.stats.semantic_hits.fetch_add(1, Ordering::Relaxed);
                                tracing::debug!(
                                    "semantic near-hit: {} served by {} (cos {:.3})",
                                    key,
                                    other_key,
                                    similarity
                                );
                                return Ok((results, CacheHitKind::Semantic));
                            }
                        }
                    }
                }

                let results = compute().await?;
                let evicted =
                    self.queries
                        .put(key, results.clone(), opts.ttl, query_embedding);
                self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                if opts.persist {
                    self.mark_dirty(CacheClass::Query, key);
                }
                Ok((results, CacheHitKind::Miss))
            })
            .await
    }

    /// Embed a query for the near-hit scan, caching the vector under an
    /// `embedding:` key. Never fails; unusable backends mean no near-hit.
    async fn embed_for_near_hit(
        &self,
        provider: &EmbeddingProvider,
        query_text: &str,
    ) -> Option<Vec<f32>> {
        if query_text.trim().is_empty() {
            return None;
        }
        let ekey = embedding_key(&provider.active_model_id(), query_text);
        let eopts = CacheOpts {
            persist: true,
            allow_semantic: false,
            ..Default::default()
        };
        self.get_or_compute_embedding(&ekey, &eopts, || async {
            provider.embed(query_text).await.map(|e| e.vector)
        })
        .await
        .map_err(|e: crate::embeddings::EmbeddingError| {
            tracing::debug!("near-hit embedding unavailable: {}", e);
        })
        .ok()
    }

    // ========================================================================
    // DOCUMENT CLASS
    // ========================================================================

    /// Get or compute a document chunk payload
    pub async fn get_or_compute_doc<E, F, Fut>(
        &self,
        key: &str,
        opts: &CacheOpts,
        compute: F,
    ) -> Result<DocumentChunk, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DocumentChunk, E>>,
    {
        self.stats.total_queries.fetch_add(1, Ordering::Relaxed);

        if let Some(chunk) = self.documents.get(key) {
            self.stats.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(chunk);
        }
        self.stats.memory_misses.fetch_add(1, Ordering::Relaxed);

        let opts = opts.clone();
        self.flight_documents
            .run(key, || async move {
                if let Some(chunk) = self.documents.get(key) {
                    return Ok(chunk);
                }

                if opts.persist {
                    if let Some(chunk) =
                        self.disk.read_json::<DocumentChunk>(CacheClass::Document, key)
                    {
                        self.stats.disk_hits.fetch_add(1, Ordering::Relaxed);
                        let evicted = self.documents.put(key, chunk.clone(), opts.ttl, None);
                        self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                        return Ok(chunk);
                    }
                    self.stats.disk_misses.fetch_add(1, Ordering::Relaxed);
                }

                let chunk = compute().await?;
                let evicted = self.documents.put(key, chunk.clone(), opts.ttl, None);
                self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                if opts.persist {
                    self.mark_dirty(CacheClass::Document, key);
                }
                Ok(chunk)
            })
            .await
    }

    // ========================================================================
    // CONTEXTUAL CLASS
    // ========================================================================

    /// Get or compute a contextual enhancement result
    pub async fn get_or_compute_contextual<E, F, Fut>(
        &self,
        key: &str,
        opts: &CacheOpts,
        compute: F,
    ) -> Result<EnhancedText, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<EnhancedText, E>>,
    {
        self.stats.total_queries.fetch_add(1, Ordering::Relaxed);

        if let Some(enhanced) = self.contextual.get(key) {
            self.stats.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(enhanced);
        }
        self.stats.memory_misses.fetch_add(1, Ordering::Relaxed);

        let opts = opts.clone();
        self.flight_contextual
            .run(key, || async move {
                if let Some(enhanced) = self.contextual.get(key) {
                    return Ok(enhanced);
                }

                if opts.persist {
                    if let Some(enhanced) =
                        self.disk.read_json::<EnhancedText>(CacheClass::Contextual, key)
                    {
                        self.stats.disk_hits.fetch_add(1, Ordering::Relaxed);
                        let evicted = self.contextual.put(key, enhanced.clone(), opts.ttl, None);
                        self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                        return Ok(enhanced);
                    }
                    self.stats.disk_misses.fetch_add(1, Ordering::Relaxed);
                }

                let enhanced = compute().await?;
                let evicted = self.contextual.put(key, enhanced.clone(), opts.ttl, None);
                self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
                if opts.persist {
                    self.mark_dirty(CacheClass::Contextual, key);
                }
                Ok(enhanced)
            })
            .await
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Flush dirty entries to disk and rewrite the manifest.
    ///
    /// Runs on the background interval and at shutdown. Writers never block
    /// on this; entries evicted before a flush are simply not persisted.
    pub fn flush(&self) {
        let dirty: Vec<(CacheClass, String)> = {
            let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
            dirty.drain().collect()
        };

        for (class, key) in &dirty {
            match class {
                CacheClass::Embedding => {
                    if let Some(vector) = self.embeddings.peek(key) {
                        self.disk.write_embedding(key, &vector);
                    }
                }
                CacheClass::Query => {
                    if let Some(results) = self.queries.peek(key) {
                        let persisted = PersistedQuery {
                            results,
                            embedding: self.queries.peek_embedding(key),
                        };
                        self.disk.write_json(CacheClass::Query, key, &persisted);
                    }
                }
                CacheClass::Document => {
                    if let Some(chunk) = self.documents.peek(key) {
                        self.disk.write_json(CacheClass::Document, key, &chunk);
                    }
                }
                CacheClass::Contextual => {
                    if let Some(enhanced) = self.contextual.peek(key) {
                        self.disk.write_json(CacheClass::Contextual, key, &enhanced);
                    }
                }
            }
        }

        let recent_embeddings = self
            .embeddings
            .recent_keys(self.config.manifest_cap)
            .into_iter()
            .map(|key| ManifestEntry {
                hash: key_hash(&key),
                key,
                timestamp: chrono::Utc::now(),
            })
            .collect();

        let manifest = Manifest::new(
            ManifestCounts {
                embeddings: self.embeddings.len(),
                queries: self.queries.len(),
                documents: self.documents.len(),
                contextual: self.contextual.len(),
            },
            recent_embeddings,
        );
        self.disk.write_manifest(&manifest);
    }

    /// Seed the embedding tier from the manifest's most-recent entries.
    ///
    /// A missing or corrupt manifest means a cold start, nothing more.
    /// Returns how many entries were promoted.
    pub fn warm_start(&self) -> usize {
        let Some(manifest) = self.disk.read_manifest() else {
            return 0;
        };

        let mut promoted = 0;
        for entry in &manifest.recent_embeddings {
            if let Some(vector) = self.disk.read_embedding(&entry.key) {
                self.embeddings.put(&entry.key, vector, None, None);
                promoted += 1;
            }
        }
        tracing::info!("cache warm start promoted {} embeddings", promoted);
        promoted
    }

    /// Drop the cached document payload for a chunk (used when a source is
    /// removed)
    pub fn invalidate_document(&self, chunk_id: &str) {
        let key = doc_key(chunk_id);
        self.documents.remove(&key);
        self.disk.remove(CacheClass::Document, &key);
    }

    /// Drop all cached query results (ingestion/removal makes them stale)
    pub fn clear_queries(&self) {
        self.queries.clear();
    }

    /// Drop expired entries across all tiers; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        self.embeddings.purge_expired()
            + self.queries.purge_expired()
            + self.documents.purge_expired()
            + self.contextual.purge_expired()
    }

    /// Clear every tier, the disk cache, and reset statistics. Idempotent.
    pub fn clear(&self) {
        self.embeddings.clear();
        self.queries.clear();
        self.documents.clear();
        self.contextual.clear();
        self.disk.clear();
        {
            let mut dirty = self.dirty.lock().unwrap_or_else(|e| e.into_inner());
            dirty.clear();
        }
        self.stats.reset();
    }

    /// Atomic snapshot of the counters
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Fraction of the combined in-memory byte budget currently in use
    pub fn memory_pressure(&self) -> f32 {
        let used = self.embeddings.total_bytes()
            + self.queries.total_bytes()
            + self.documents.total_bytes()
            + self.contextual.total_bytes();
        let budget = self.config.embedding_tier.max_bytes
            + self.config.query_tier.max_bytes
            + self.config.document_tier.max_bytes
            + self.config.contextual_tier.max_bytes;
        if budget == 0 {
            return 0.0;
        }
        used as f32 / budget as f32
    }

    /// Entry counts per tier: (embeddings, queries, documents, contextual)
    pub fn tier_sizes(&self) -> (usize, usize, usize, usize) {
        (
            self.embeddings.len(),
            self.queries.len(),
            self.documents.len(),
            self.contextual.len(),
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkMetadata, Strategy};
    use crate::embeddings::EmbeddingMode;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn temp_cache() -> (tempfile::TempDir, MultiTierCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = MultiTierCache::new(CacheConfig::new(dir.path().join("cache")));
        (dir, cache)
    }

    fn result(id: &str, score: f32) -> SearchResult {
        SearchResult::new(
            id,
            format!("content of {}", id),
            score,
            ChunkMetadata::default(),
            Strategy::Keyword,
            "test",
        )
    }

    #[test]
    fn test_class_from_key() {
        assert_eq!(
            CacheClass::from_key("embedding:m:abc"),
            Some(CacheClass::Embedding)
        );
        assert_eq!(CacheClass::from_key("query:fast:5:x"), Some(CacheClass::Query));
        assert_eq!(CacheClass::from_key("doc:c1"), Some(CacheClass::Document));
        assert_eq!(
            CacheClass::from_key("contextual:a:b"),
            Some(CacheClass::Contextual)
        );
        assert_eq!(CacheClass::from_key("unknown:x"), None);
    }

    #[tokio::test]
    async fn test_embedding_memory_hit() {
        let (_dir, cache) = temp_cache();
        let key = embedding_key("m", "hello");
        let computes = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let computes = Arc::clone(&computes);
            let vector = cache
                .get_or_compute_embedding(&key, &CacheOpts::default(), || async move {
                    computes.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(vec![1.0, 2.0])
                })
                .await
                .unwrap();
            assert_eq!(vector, vec![1.0, 2.0]);
        }

        assert_eq!(computes.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.memory_hits, 2);
        assert_eq!(stats.memory_misses, 1);
    }

    #[tokio::test]
    async fn test_disk_promotion_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        let key = embedding_key("m", "persist me");
        let opts = CacheOpts {
            persist: true,
            ..Default::default()
        };

        {
            let cache = MultiTierCache::new(CacheConfig::new(root.clone()));
            cache
                .get_or_compute_embedding(&key, &opts, || async {
                    Ok::<_, Infallible>(vec![9.0, 8.0])
                })
                .await
                .unwrap();
            cache.flush();
        }

        // Fresh cache instance: T1 is cold, T2 answers
        let cache = MultiTierCache::new(CacheConfig::new(root));
        let vector = cache
            .get_or_compute_embedding(&key, &opts, || async {
                panic!("compute must not run on a disk hit")
            })
            .await
            .unwrap_or_else(|_: Infallible| unreachable!());
        assert_eq!(vector, vec![9.0, 8.0]);
        assert_eq!(cache.stats().disk_hits, 1);
    }

    #[tokio::test]
    async fn test_query_near_hit_threshold() {
        let (_dir, cache) = temp_cache();
        let provider = EmbeddingProvider::new(EmbeddingMode::Fallback, None);
        let opts = CacheOpts::default();

        // Populate an entry for the original phrasing
        let (first, kind) = cache
            .get_or_compute_query(
                &query_key("balanced", 5, "how to open file"),
                "how to open file",
                &opts,
                Some(&provider),
                || async { Ok::<_, Infallible>(vec![result("c1", 0.9)]) },
            )
            .await
            .unwrap();
        assert_eq!(kind, CacheHitKind::Miss);
        assert_eq!(first.len(), 1);

        // Identical text under a different key: embeddings are identical,
        // cosine 1.0 >= threshold, so the near-hit serves the first entry
        let (served, kind) = cache
            .get_or_compute_query(
                &query_key("balanced", 5, "how to open file?"),
                "how to open file",
                &opts,
                Some(&provider),
                || async { panic!("near-hit must not compute") },
            )
            .await
            .unwrap_or_else(|_: Infallible| unreachable!());
        assert_eq!(kind, CacheHitKind::Semantic);
        assert_eq!(served[0].id, "c1");
        assert_eq!(cache.stats().semantic_hits, 1);
    }

    #[tokio::test]
    async fn test_query_near_hit_disabled() {
        let (_dir, cache) = temp_cache();
        let provider = EmbeddingProvider::new(EmbeddingMode::Fallback, None);
        let opts = CacheOpts {
            allow_semantic: false,
            ..Default::default()
        };

        cache
            .get_or_compute_query(
                &query_key("balanced", 5, "query a"),
                "identical text",
                &opts,
                Some(&provider),
                || async { Ok::<_, Infallible>(vec![result("c1", 0.9)]) },
            )
            .await
            .unwrap();

        let (_, kind) = cache
            .get_or_compute_query(
                &query_key("balanced", 5, "query b"),
                "identical text",
                &opts,
                Some(&provider),
                || async { Ok::<_, Infallible>(vec![result("c2", 0.8)]) },
            )
            .await
            .unwrap();
        assert_eq!(kind, CacheHitKind::Miss);
        assert_eq!(cache.stats().semantic_hits, 0);
    }

    #[tokio::test]
    async fn test_single_flight_exactly_once() {
        let (_dir, cache) = temp_cache();
        let cache = Arc::new(cache);
        let computes = Arc::new(AtomicUsize::new(0));
        let key = embedding_key("m", "contended");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let computes = Arc::clone(&computes);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute_embedding(&key, &CacheOpts::default(), || async move {
                        computes.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok::<_, Infallible>(vec![1.0])
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), vec![1.0]);
        }
        assert_eq!(computes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_resets_stats_idempotent() {
        let (_dir, cache) = temp_cache();
        cache
            .get_or_compute_embedding(&embedding_key("m", "x"), &CacheOpts::default(), || async {
                Ok::<_, Infallible>(vec![1.0])
            })
            .await
            .unwrap();
        assert!(cache.stats().total_queries > 0);

        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.total_queries, 0);
        assert_eq!(stats.memory_hits, 0);

        // Second clear leaves the same zero state
        cache.clear();
        assert_eq!(cache.stats().total_queries, 0);
        assert_eq!(cache.tier_sizes(), (0, 0, 0, 0));
    }

    #[tokio::test]
    async fn test_query_ttl_expiry() {
        let (_dir, cache) = temp_cache();
        let opts = CacheOpts {
            ttl: Some(Duration::from_millis(0)),
            allow_semantic: false,
            ..Default::default()
        };
        let key = query_key("fast", 3, "ephemeral");

        cache
            .get_or_compute_query(&key, "ephemeral", &opts, None, || async {
                Ok::<_, Infallible>(vec![result("c1", 0.5)])
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;

        let (_, kind) = cache
            .get_or_compute_query(&key, "ephemeral", &opts, None, || async {
                Ok::<_, Infallible>(vec![result("c2", 0.6)])
            })
            .await
            .unwrap();
        assert_eq!(kind, CacheHitKind::Miss);
    }

    #[tokio::test]
    async fn test_invalidate_document() {
        let (_dir, cache) = temp_cache();
        let chunk = DocumentChunk {
            id: "c1".to_string(),
            source_id: "s1".to_string(),
            content: "payload".to_string(),
            chunk_index: 0,
            content_hash: "h".to_string(),
            metadata: ChunkMetadata::default(),
            ingested_at: chrono::Utc::now(),
            embedding_model: None,
        };

        let stored = chunk.clone();
        cache
            .get_or_compute_doc(&doc_key("c1"), &CacheOpts::default(), || async move {
                Ok::<_, Infallible>(stored)
            })
            .await
            .unwrap();

        cache.invalidate_document("c1");

        let recomputed = chunk.clone();
        let fetched = cache
            .get_or_compute_doc(&doc_key("c1"), &CacheOpts::default(), || async move {
                Ok::<_, Infallible>(recomputed)
            })
            .await
            .unwrap();
        assert_eq!(fetched.id, "c1");
        // One miss for the initial fill, one for the post-invalidation fill
        assert_eq!(cache.stats().memory_misses, 2);
    }
}
