//! Quantified invariants

use trove_e2e_tests::{large_corpus, TestEngine};
use trove_core::{
    ChunkInput, EmbeddingMode, EmbeddingProvider, SearchOptions, SearchProfile,
};

/// For all queries and limits: |search(q, limit=n)| <= n
#[tokio::test]
async fn result_count_never_exceeds_limit() {
    let harness = TestEngine::new().await;
    for (source_id, chunk_index, content) in large_corpus(64) {
        harness
            .engine
            .add_chunk(ChunkInput {
                source_id,
                content,
                chunk_index,
                metadata: Default::default(),
            })
            .await
            .unwrap();
    }

    for profile in [
        SearchProfile::Fast,
        SearchProfile::Balanced,
        SearchProfile::Accurate,
        SearchProfile::Research,
    ] {
        for limit in [1, 3, 7, 25] {
            let opts = SearchOptions {
                profile,
                limit,
                use_cache: false,
                ..harness.engine.default_options()
            };
            let response = harness
                .engine
                .search("memory allocation scheduling", opts)
                .await
                .unwrap();
            assert!(
                response.results.len() <= limit,
                "profile {} limit {} returned {}",
                profile,
                limit,
                response.results.len()
            );
        }
    }
}

/// For all results: 0 <= score <= 1
#[tokio::test]
async fn scores_always_normalized() {
    let harness = TestEngine::new().await;
    for (source_id, chunk_index, content) in large_corpus(48) {
        harness
            .engine
            .add_chunk(ChunkInput {
                source_id,
                content,
                chunk_index,
                metadata: Default::default(),
            })
            .await
            .unwrap();
    }

    for query in [
        "asynchronous runtimes",
        "entropy coding",
        "congestion",
        "zzz nothing matches this zzz",
    ] {
        let response = harness
            .engine
            .search(query, harness.engine.default_options())
            .await
            .unwrap();
        for result in &response.results {
            assert!(
                (0.0..=1.0).contains(&result.score),
                "query {:?} produced score {}",
                query,
                result.score
            );
        }
    }
}

/// Identical content stores exactly one chunk regardless of source claims
#[tokio::test]
async fn content_hash_dedup_holds() {
    let harness = TestEngine::new().await;

    let id_a = harness
        .engine
        .add_chunk(ChunkInput {
            source_id: "a".into(),
            content: "duplicate payload".into(),
            chunk_index: 0,
            metadata: Default::default(),
        })
        .await
        .unwrap();
    let id_b = harness
        .engine
        .add_chunk(ChunkInput {
            source_id: "b".into(),
            content: "duplicate payload".into(),
            chunk_index: 9,
            metadata: Default::default(),
        })
        .await
        .unwrap();

    assert_eq!(id_a, id_b);
    let stats = harness.engine.statistics().await.unwrap();
    assert_eq!(stats.chunk_count, 1);
}

/// Every provider vector is unit-norm within 1e-5
#[tokio::test]
async fn fallback_vectors_are_unit_norm() {
    let provider = EmbeddingProvider::new(EmbeddingMode::Fallback, None);
    for text in [
        "a",
        "short text",
        "a considerably longer piece of text with many words in it",
        "unicode: Grüße, 世界, здравствуйте",
    ] {
        let embedding = provider.embed(text).await.unwrap();
        let norm: f32 = embedding.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!(
            (norm - 1.0).abs() < 1e-5,
            "norm {} for {:?}",
            norm,
            text
        );
    }
}

/// A repeated query within TTL reports a cache hit and the same results
#[tokio::test]
async fn repeat_query_within_ttl_hits() {
    let harness = TestEngine::new().await;
    for (source_id, chunk_index, content) in large_corpus(32) {
        harness
            .engine
            .add_chunk(ChunkInput {
                source_id,
                content,
                chunk_index,
                metadata: Default::default(),
            })
            .await
            .unwrap();
    }

    let opts = harness.engine.default_options();
    let first = harness
        .engine
        .search("parser combinators", opts.clone())
        .await
        .unwrap();
    let second = harness
        .engine
        .search("parser combinators", opts)
        .await
        .unwrap();

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(
        first.results.iter().map(|r| &r.id).collect::<Vec<_>>(),
        second.results.iter().map(|r| &r.id).collect::<Vec<_>>()
    );
}

/// Ingestion across concurrent tasks coalesces into consistent state
#[tokio::test]
async fn concurrent_searches_do_not_interfere() {
    let harness = std::sync::Arc::new(TestEngine::new().await);
    for (source_id, chunk_index, content) in large_corpus(32) {
        harness
            .engine
            .add_chunk(ChunkInput {
                source_id,
                content,
                chunk_index,
                metadata: Default::default(),
            })
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..8 {
        let harness = std::sync::Arc::clone(&harness);
        handles.push(tokio::spawn(async move {
            let opts = SearchOptions {
                limit: 5,
                ..harness.engine.default_options()
            };
            harness
                .engine
                .search(&format!("cache coherence {}", i % 2), opts)
                .await
                .unwrap()
        }));
    }

    for handle in handles {
        let response = handle.await.unwrap();
        assert!(response.results.len() <= 5);
        for result in &response.results {
            assert!((0.0..=1.0).contains(&result.score));
        }
    }
}
