//! Search Façade
//!
//! Single entry point for the retrieval engine. Owns every service (store,
//! indices, cache, embedding provider, reranker, enhancer, pipeline); the
//! services receive shared views and never reach back.
//!
//! Lifecycle: construction is cheap and synchronous; `initialize()` loads
//! the vector index, warms the cache, loads model weights, and starts the
//! background cache flush — guarded by a one-shot latch so concurrent calls
//! coalesce. Reranker or enhancer failure is non-fatal: the façade records
//! a degraded flag and continues.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, OnceCell, RwLock};
use tokio::task::JoinHandle;

use crate::cache::{self, CacheHitKind, CacheOpts, CacheStats, MultiTierCache};
use crate::chunk::{ChunkInput, SearchResult, Strategy};
use crate::config::{DataLayout, EngineConfig};
use crate::embeddings::{cosine_to_unit, EmbeddingError, EmbeddingProvider};
use crate::enhance::ContextualEnhancer;
use crate::index::{
    KeywordFilters, KeywordIndex, VectorIndex, VectorIndexConfig, VectorIndexError, VectorMeta,
};
use crate::pipeline::{
    merge_candidates, query_tokens, PipelineMetrics, PipelineServices, RetrievalPipeline,
    SearchOptions,
};
use crate::rerank::{CrossEncoderReranker, RerankConfig};
use crate::store::{ChunkStore, StoreError};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Façade error type.
///
/// `search()` surfaces only `InvalidInput`; every other failure inside a
/// search degrades to annotations per the pipeline failure model. The
/// remaining variants can reach callers of lifecycle and ingestion
/// operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Empty query, zero-sized batch, or similar caller mistakes
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// Chunk store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    /// Vector index failure
    #[error("Vector index error: {0}")]
    Vector(#[from] VectorIndexError),
    /// Embedding failure on every backend
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
    /// Initialization failure
    #[error("Initialization error: {0}")]
    Init(String),
}

/// Façade result type
pub type EngineResult<T> = std::result::Result<T, EngineError>;

// ============================================================================
// EVENTS
// ============================================================================

/// Progress events published on the façade's broadcast channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum SearchEvent {
    /// A pipeline stage completed
    Stage {
        /// Stage name
        stage: String,
        /// Fraction of stages completed, in [0, 1]
        progress: f32,
    },
    /// A search call completed
    Completed {
        /// Wall time of the call in ms
        duration_ms: u64,
        /// Number of results returned
        result_count: usize,
        /// Whether any cache tier answered
        cache_hit: bool,
    },
}

// ============================================================================
// RESPONSE & STATISTICS
// ============================================================================

/// Result of a `search()` call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    /// Ranked results, at most `limit`
    pub results: Vec<SearchResult>,
    /// Whether any cache tier answered
    pub cache_hit: bool,
    /// Which tier answered
    pub hit_kind: CacheHitKind,
    /// Wall time of the call in ms
    pub duration_ms: u64,
    /// Pipeline metrics (present when the pipeline actually ran)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PipelineMetrics>,
}

/// Aggregate engine statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatistics {
    /// Stored chunks
    pub chunk_count: i64,
    /// Distinct sources
    pub source_count: i64,
    /// Chunks with stored embeddings
    pub embedding_count: i64,
    /// Vectors in the index
    pub vector_count: usize,
    /// Embedding model resident in the vector index
    pub vector_model: Option<String>,
    /// Cache counters
    pub cache: CacheStats,
    /// The cross-encoder failed to load (or was disabled)
    pub reranker_degraded: bool,
    /// The generative enhancer is unavailable (simple enhancement applies)
    pub enhancer_degraded: bool,
    /// Metrics of the most recent pipeline run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<PipelineMetrics>,
}

// ============================================================================
// ENGINE
// ============================================================================

/// The search engine façade
pub struct SearchEngine {
    config: EngineConfig,
    layout: DataLayout,
    store: Arc<ChunkStore>,
    keyword: Arc<KeywordIndex>,
    vectors: Arc<RwLock<VectorIndex>>,
    provider: Arc<EmbeddingProvider>,
    cache: Arc<MultiTierCache>,
    reranker: Arc<CrossEncoderReranker>,
    enhancer: Arc<ContextualEnhancer>,
    pipeline: RetrievalPipeline,
    init: OnceCell<()>,
    reranker_degraded: AtomicBool,
    enhancer_degraded: AtomicBool,
    events: broadcast::Sender<SearchEvent>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    last_metrics: Mutex<Option<PipelineMetrics>>,
}

impl SearchEngine {
    /// Construct the engine; cheap and synchronous. Model loading and index
    /// restoration happen in [`SearchEngine::initialize`].
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let layout = match &config.data_dir {
            Some(dir) => DataLayout::new(dir.clone()),
            None => DataLayout::default_location()
                .ok_or_else(|| EngineError::Init("could not resolve data directory".to_string()))?,
        };

        // Model weights live under the data directory unless overridden;
        // both fastembed backends read this through the env var
        let model_dir = config
            .model_cache_dir
            .clone()
            .unwrap_or_else(|| layout.models_dir());
        std::env::set_var("TROVE_MODEL_CACHE", &model_dir);

        let store = Arc::new(ChunkStore::open(&layout.docs_db())?);
        let keyword = Arc::new(KeywordIndex::open(store.db_path())?);
        let vectors = Arc::new(RwLock::new(VectorIndex::new()?));
        let provider = Arc::new(EmbeddingProvider::new(
            config.embedding_model,
            config.api_key.clone(),
        ));
        let cache = Arc::new(MultiTierCache::new(cache::CacheConfig::new(
            layout.cache_dir(),
        )));
        let reranker = Arc::new(CrossEncoderReranker::new(
            RerankConfig::default(),
            Arc::clone(&provider),
        ));
        let enhancer = Arc::new(ContextualEnhancer::new(
            config.enhancement_strategy,
            Arc::clone(&provider),
            Arc::clone(&cache),
            config.api_key.clone(),
        ));

        let services = PipelineServices {
            store: Arc::clone(&store),
            keyword: Arc::clone(&keyword),
            vectors: Arc::clone(&vectors),
            provider: Arc::clone(&provider),
            cache: Arc::clone(&cache),
            reranker: config.enable_reranking.then(|| Arc::clone(&reranker)),
            enhancer: config.enable_contextual.then(|| Arc::clone(&enhancer)),
        };

        let (events, _) = broadcast::channel(64);

        Ok(Self {
            config,
            layout,
            store,
            keyword,
            vectors,
            provider,
            cache,
            reranker,
            enhancer,
            pipeline: RetrievalPipeline::new(services),
            init: OnceCell::new(),
            reranker_degraded: AtomicBool::new(true),
            enhancer_degraded: AtomicBool::new(true),
            events,
            flush_task: Mutex::new(None),
            last_metrics: Mutex::new(None),
        })
    }

    /// Default search options under this engine's configuration
    pub fn default_options(&self) -> SearchOptions {
        SearchOptions {
            profile: self.config.search_profile,
            rerank: self.config.enable_reranking,
            ..Default::default()
        }
    }

    /// Subscribe to progress events
    pub fn subscribe(&self) -> broadcast::Receiver<SearchEvent> {
        self.events.subscribe()
    }

    /// Rotate the API key; propagates to the embedding provider and the
    /// contextual enhancer
    pub fn set_api_key(&self, key: Option<String>) {
        self.provider.set_api_key(key.clone());
        self.enhancer.set_api_key(key);
        self.enhancer_degraded
            .store(!self.enhancer.has_generative_backend(), Ordering::Relaxed);
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// One-shot initialization; concurrent calls coalesce on a latch.
    ///
    /// Loads (or rebuilds) the vector index, warms the cache from the
    /// manifest, loads the cross-encoder, and starts the background flush.
    pub async fn initialize(&self) -> EngineResult<()> {
        self.init
            .get_or_try_init(|| async {
                let started = Instant::now();

                self.restore_vector_index().await?;
                self.cache.warm_start();

                if self.config.enable_reranking {
                    let loaded = self.reranker.init();
                    self.reranker_degraded.store(!loaded, Ordering::Relaxed);
                    if loaded {
                        self.reranker.warmup();
                    }
                }
                self.enhancer_degraded
                    .store(!self.enhancer.has_generative_backend(), Ordering::Relaxed);

                self.spawn_flush_task();

                tracing::info!("engine initialized in {:?}", started.elapsed());
                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// Load the persisted vector index; corruption or a model-id mismatch
    /// falls back to a rebuild from the chunk store's embedding rows
    async fn restore_vector_index(&self) -> EngineResult<()> {
        let path = self.layout.vector_index();
        let active_model = self.provider.active_model_id();

        if path.exists() {
            match VectorIndex::load(&path, VectorIndexConfig::default()) {
                Ok(index) if index.model_id().is_none_or(|m| m == active_model) => {
                    tracing::info!("vector index loaded: {} vectors", index.len());
                    *self.vectors.write().await = index;
                    return Ok(());
                }
                Ok(index) => {
                    tracing::warn!(
                        "vector index model {} differs from active {}, rebuilding",
                        index.model_id().unwrap_or("<none>"),
                        active_model
                    );
                }
                Err(e) => {
                    tracing::warn!("vector index load failed, rebuilding: {}", e);
                }
            }
        }

        self.rebuild_vector_index().await
    }

    /// Rebuild the vector index from stored embedding rows, keeping only
    /// rows produced by the active model
    async fn rebuild_vector_index(&self) -> EngineResult<()> {
        let rows = self.store.all_embeddings()?;
        let active_model = self.provider.active_model_id();

        let mut index = self.vectors.write().await;
        index.clear()?;

        let mut skipped = 0usize;
        for (chunk_id, source_id, embedding) in rows {
            if embedding.model_id != active_model {
                skipped += 1;
                continue;
            }
            if let Err(e) = index.insert(
                &chunk_id,
                &embedding.vector,
                &embedding.model_id,
                VectorMeta { source_id },
            ) {
                tracing::warn!("skipping vector for {}: {}", chunk_id, e);
            }
        }

        if skipped > 0 {
            tracing::warn!(
                "{} embeddings from other models excluded from the vector index; \
                 run precompute_embeddings() to regenerate them with {}",
                skipped,
                active_model
            );
        }
        tracing::info!("vector index rebuilt: {} vectors", index.len());
        Ok(())
    }

    fn spawn_flush_task(&self) {
        let cache = Arc::clone(&self.cache);
        let interval = cache.config().flush_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                cache.flush();
            }
        });
        let mut guard = self.flush_task.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(handle);
    }

    /// Flush the cache, persist the vector index, and stop background work
    pub async fn shutdown(&self) {
        {
            let mut guard = self.flush_task.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        self.cache.flush();

        let index = self.vectors.read().await;
        if !index.is_empty() {
            if let Err(e) = index.save(&self.layout.vector_index()) {
                tracing::warn!("vector index save failed at shutdown: {}", e);
            }
        }
        tracing::info!("engine shut down");
    }

    // ========================================================================
    // SEARCH
    // ========================================================================

    /// Full pipeline search with caching
    pub async fn search(
        &self,
        query: &str,
        opts: SearchOptions,
    ) -> EngineResult<SearchResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Err(EngineError::InvalidInput("query cannot be empty".to_string()));
        }
        self.initialize().await?;

        let started = Instant::now();

        if opts.limit == 0 {
            return Ok(SearchResponse {
                results: vec![],
                cache_hit: false,
                hit_kind: CacheHitKind::Miss,
                duration_ms: 0,
                metrics: None,
            });
        }

        let events = self.events.clone();
        let on_stage = move |stage: &str, progress: f32| {
            let _ = events.send(SearchEvent::Stage {
                stage: stage.to_string(),
                progress,
            });
        };

        let (results, hit_kind) = if opts.use_cache {
            let key = cache::query_key(&opts.profile.to_string(), opts.limit, query);
            let cache_opts = CacheOpts {
                allow_semantic: true,
                persist: true,
                ..Default::default()
            };
            self.cache
                .get_or_compute_query(&key, query, &cache_opts, Some(&*self.provider), || async {
                    let (results, metrics) = self.pipeline.run(query, &opts, &on_stage).await;
                    self.record_metrics(metrics);
                    Ok::<_, EngineError>(results)
                })
                .await?
        } else {
            let (results, metrics) = self.pipeline.run(query, &opts, &on_stage).await;
            self.record_metrics(metrics);
            (results, CacheHitKind::Miss)
        };

        self.maybe_cleanup();

        let duration_ms = started.elapsed().as_millis() as u64;
        let cache_hit = hit_kind.is_hit();
        let _ = self.events.send(SearchEvent::Completed {
            duration_ms,
            result_count: results.len(),
            cache_hit,
        });

        let metrics = if cache_hit {
            None
        } else {
            self.last_metrics
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        };

        Ok(SearchResponse {
            results,
            cache_hit,
            hit_kind,
            duration_ms,
            metrics,
        })
    }

    /// Direct index lookup, bypassing the pipeline
    pub async fn simple_search(
        &self,
        query: &str,
        limit: usize,
    ) -> EngineResult<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(EngineError::InvalidInput("query cannot be empty".to_string()));
        }
        self.initialize().await?;
        if limit == 0 {
            return Ok(vec![]);
        }

        let mut results: Vec<SearchResult> = Vec::new();

        if let Ok(embedding) = self.provider.embed(query).await {
            let index = self.vectors.read().await;
            if let Ok(hits) = index.query(&embedding.vector, limit) {
                for hit in hits {
                    if let Some(chunk) = self.store.get_chunk(&hit.id)? {
                        results.push(SearchResult::new(
                            hit.id,
                            chunk.content,
                            cosine_to_unit(hit.similarity),
                            chunk.metadata,
                            Strategy::Semantic,
                            format!("vector similarity {:.2}", hit.similarity),
                        ));
                    }
                }
            }
        }

        let tokens = query_tokens(query);
        if !tokens.is_empty() {
            let hits = self
                .keyword
                .query(&tokens, limit, &KeywordFilters::default())?;
            let keyword_results: Vec<SearchResult> = hits
                .into_iter()
                .map(|hit| {
                    SearchResult::new(
                        hit.id,
                        hit.content,
                        0.5,
                        hit.metadata,
                        Strategy::Keyword,
                        format!("keyword match (bm25 {:.2})", hit.rank_score),
                    )
                })
                .collect();
            results = merge_candidates(results, keyword_results);
        }

        for result in &mut results {
            result.score = result.score.clamp(0.0, 1.0);
        }
        results.truncate(limit);
        Ok(results)
    }

    /// Keyword + vector merge without reranking
    pub async fn hybrid_search(
        &self,
        query: &str,
        limit: usize,
    ) -> EngineResult<Vec<SearchResult>> {
        let results = self.simple_search(query, limit * 2).await?;
        let mut merged = crate::pipeline::hybrid_merge(results, limit);
        for result in &mut merged {
            result.score = result.score.clamp(0.0, 1.0);
        }
        merged.truncate(limit);
        Ok(merged)
    }

    fn record_metrics(&self, metrics: PipelineMetrics) {
        let mut guard = self.last_metrics.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(metrics);
    }

    /// Sweep expired cache entries when memory pressure crosses the
    /// configured threshold
    fn maybe_cleanup(&self) {
        if self.cache.memory_pressure() > self.config.auto_cleanup_threshold {
            let purged = self.cache.purge_expired();
            tracing::debug!("auto-cleanup purged {} expired cache entries", purged);
        }
    }

    // ========================================================================
    // INGESTION
    // ========================================================================

    /// Ingest a chunk: hash, store, embed, index. Returns the chunk id
    /// (the existing id when content-hash dedup applies).
    pub async fn add_chunk(&self, input: ChunkInput) -> EngineResult<String> {
        if input.content.trim().is_empty() {
            return Err(EngineError::InvalidInput("chunk content cannot be empty".to_string()));
        }
        self.initialize().await?;

        let chunk = self.store.add_chunk(&input)?;

        if chunk.embedding_model.is_none() {
            match self.provider.embed(&chunk.content).await {
                Ok(embedding) => {
                    self.store.put_embedding(&chunk.id, &embedding)?;
                    self.insert_vector(&chunk.id, &chunk.source_id, &embedding).await;
                }
                Err(e) => {
                    tracing::warn!(
                        "embedding deferred for {} (precompute will retry): {}",
                        chunk.id,
                        e
                    );
                }
            }
        }

        // New content makes cached result lists stale
        self.cache.clear_queries();
        Ok(chunk.id)
    }

    /// Ingest a batch of chunks
    pub async fn add_chunks_batch(&self, inputs: Vec<ChunkInput>) -> EngineResult<Vec<String>> {
        let mut ids = Vec::with_capacity(inputs.len());
        for input in inputs {
            ids.push(self.add_chunk(input).await?);
        }
        Ok(ids)
    }

    async fn insert_vector(
        &self,
        chunk_id: &str,
        source_id: &str,
        embedding: &crate::embeddings::Embedding,
    ) {
        let meta = VectorMeta {
            source_id: Some(source_id.to_string()),
        };
        let mut index = self.vectors.write().await;
        match index.insert(chunk_id, &embedding.vector, &embedding.model_id, meta.clone()) {
            Ok(()) => {}
            Err(VectorIndexError::ModelMismatch { resident, offered }) => {
                tracing::warn!(
                    "vector index holds {} but provider produces {}; rebuilding",
                    resident,
                    offered
                );
                drop(index);
                if self.rebuild_vector_index().await.is_ok() {
                    let mut index = self.vectors.write().await;
                    if let Err(e) =
                        index.insert(chunk_id, &embedding.vector, &embedding.model_id, meta)
                    {
                        tracing::warn!("vector insert failed after rebuild: {}", e);
                    }
                }
            }
            Err(e) => tracing::warn!("vector insert failed for {}: {}", chunk_id, e),
        }
    }

    /// Remove a source and cascade: chunks, FTS rows, embeddings, vector
    /// entries, cached documents. Returns how many chunks were removed.
    pub async fn remove_source(&self, source_id: &str) -> EngineResult<usize> {
        self.initialize().await?;

        let ids = self.store.chunk_ids_for_source(source_id)?;
        let removed = self.store.remove_source(source_id)?;

        {
            let mut index = self.vectors.write().await;
            for id in &ids {
                if let Err(e) = index.delete(id) {
                    tracing::warn!("vector delete failed for {}: {}", id, e);
                }
            }
        }
        for id in &ids {
            self.cache.invalidate_document(id);
        }
        self.cache.clear_queries();

        Ok(removed)
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Batch-embed every chunk without a stored embedding, updating the
    /// vector index and priming the embedding cache. `progress` receives
    /// `(done, total)` per batch. Returns how many embeddings were computed.
    pub async fn precompute_embeddings<F>(&self, progress: F) -> EngineResult<usize>
    where
        F: Fn(usize, usize),
    {
        self.initialize().await?;

        let total = (self.store.chunk_count()? - self.store.embedding_count()?).max(0) as usize;
        let mut done = 0usize;

        loop {
            let batch = self.store.chunks_missing_embeddings(32)?;
            if batch.is_empty() {
                break;
            }

            let texts: Vec<&str> = batch.iter().map(|c| c.content.as_str()).collect();
            let embeddings = self.provider.embed_batch(&texts).await?;

            for (chunk, embedding) in batch.iter().zip(embeddings.iter()) {
                self.store.put_embedding(&chunk.id, embedding)?;
                self.insert_vector(&chunk.id, &chunk.source_id, embedding).await;
                self.cache.prime_embedding(
                    &cache::embedding_key(&embedding.model_id, &chunk.content),
                    embedding.vector.clone(),
                    true,
                );
            }

            done += batch.len();
            progress(done, total.max(done));

            // Interactive queries preempt background precompute
            tokio::task::yield_now().await;
        }

        Ok(done)
    }

    /// Run canned queries to populate caches and pay model warm-up costs
    pub async fn warmup(&self) -> EngineResult<()> {
        self.initialize().await?;
        self.reranker.warmup();

        for canned in ["getting started", "how to configure", "common errors"] {
            let opts = SearchOptions {
                profile: crate::pipeline::SearchProfile::Fast,
                limit: 3,
                rerank: false,
                max_latency: std::time::Duration::from_millis(500),
                ..self.default_options()
            };
            if let Err(e) = self.search(canned, opts).await {
                tracing::debug!("warmup query failed: {}", e);
            }
        }
        Ok(())
    }

    /// Clear every cache tier and reset statistics. Idempotent.
    pub fn clear_caches(&self) {
        self.cache.clear();
    }

    /// Rebuild both indices from the chunk store
    pub async fn rebuild_indices(&self) -> EngineResult<()> {
        self.initialize().await?;
        self.keyword.reindex_all()?;
        self.rebuild_vector_index().await?;
        Ok(())
    }

    /// Aggregate statistics
    pub async fn statistics(&self) -> EngineResult<EngineStatistics> {
        let (vector_count, vector_model) = {
            let index = self.vectors.read().await;
            (index.len(), index.model_id().map(str::to_string))
        };

        Ok(EngineStatistics {
            chunk_count: self.store.chunk_count()?,
            source_count: self.store.source_count()?,
            embedding_count: self.store.embedding_count()?,
            vector_count,
            vector_model,
            cache: self.cache.stats(),
            reranker_degraded: self.reranker_degraded.load(Ordering::Relaxed),
            enhancer_degraded: self.enhancer_degraded.load(Ordering::Relaxed),
            last_run: self
                .last_metrics
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        })
    }

    /// Path helpers for collaborators (backup tooling, tests)
    pub fn data_dir(&self) -> &Path {
        self.layout.root()
    }
}

// ============================================================================
// TESTS
// ============================================================================
