//! Boundary behaviors

use std::time::Duration;

use trove_e2e_tests::{fox_corpus, TestEngine};
use trove_core::{EngineError, SearchOptions, SearchProfile};

#[tokio::test]
async fn empty_query_is_invalid_input() {
    let harness = TestEngine::new().await;
    let result = harness
        .engine
        .search("", harness.engine.default_options())
        .await;
    assert!(matches!(result, Err(EngineError::InvalidInput(_))));

    let whitespace = harness
        .engine
        .search("   \t ", harness.engine.default_options())
        .await;
    assert!(matches!(whitespace, Err(EngineError::InvalidInput(_))));
}

#[tokio::test]
async fn limit_zero_runs_no_stages() {
    let harness = TestEngine::with_corpus(&fox_corpus()).await;
    let opts = SearchOptions {
        limit: 0,
        ..harness.engine.default_options()
    };
    let response = harness.engine.search("quick fox", opts).await.unwrap();
    assert!(response.results.is_empty());
    assert!(response.metrics.is_none() || response.metrics.unwrap().stages.is_empty());
}

#[tokio::test]
async fn one_millisecond_deadline_never_panics() {
    let harness = TestEngine::with_corpus(&fox_corpus()).await;
    let opts = SearchOptions {
        profile: SearchProfile::Research,
        limit: 5,
        max_latency: Duration::from_millis(1),
        use_cache: false,
        ..harness.engine.default_options()
    };
    let response = harness.engine.search("quick fox", opts).await.unwrap();
    assert!(response.results.len() <= 5);
    for result in &response.results {
        assert!((0.0..=1.0).contains(&result.score));
    }
}

#[tokio::test]
async fn clear_caches_twice_leaves_stats_zero() {
    let harness = TestEngine::with_corpus(&fox_corpus()).await;
    harness
        .engine
        .search("quick fox", harness.engine.default_options())
        .await
        .unwrap();

    harness.engine.clear_caches();
    harness.engine.clear_caches();

    let stats = harness.engine.statistics().await.unwrap();
    assert_eq!(stats.cache.total_queries, 0);
    assert_eq!(stats.cache.memory_hits, 0);
    assert_eq!(stats.cache.semantic_hits, 0);
}

#[tokio::test]
async fn rebuild_indices_twice_is_idempotent() {
    let harness = TestEngine::with_corpus(&fox_corpus()).await;

    harness.engine.rebuild_indices().await.unwrap();
    let first = harness.engine.statistics().await.unwrap();

    harness.engine.rebuild_indices().await.unwrap();
    let second = harness.engine.statistics().await.unwrap();

    assert_eq!(first.chunk_count, second.chunk_count);
    assert_eq!(first.embedding_count, second.embedding_count);
    assert_eq!(first.vector_count, second.vector_count);

    // Queries behave identically after both rebuilds
    let results = harness
        .engine
        .simple_search("quick brown fox", 3)
        .await
        .unwrap();
    assert!(!results.is_empty());
}

#[tokio::test]
async fn remove_unknown_source_is_noop() {
    let harness = TestEngine::with_corpus(&fox_corpus()).await;
    let removed = harness.engine.remove_source("never-existed").await.unwrap();
    assert_eq!(removed, 0);

    let stats = harness.engine.statistics().await.unwrap();
    assert_eq!(stats.chunk_count, 3);
}

#[tokio::test]
async fn warmup_is_safe_on_empty_engine() {
    let harness = TestEngine::new().await;
    harness.engine.warmup().await.unwrap();

    let stats = harness.engine.statistics().await.unwrap();
    assert!(stats.cache.total_queries > 0);
}
