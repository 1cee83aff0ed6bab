//! Corpus Fixtures
//!
//! Small, deterministic corpora for the end-to-end scenarios.

/// The three-chunk corpus from the exact-match scenario
pub fn fox_corpus() -> Vec<(&'static str, i64, &'static str)> {
    vec![
        ("corpus", 0, "The quick brown fox"),
        ("corpus", 1, "Lorem ipsum dolor"),
        ("corpus", 2, "A quick red fox"),
    ]
}

/// A handful of prose chunks across two sources
pub fn prose_corpus() -> Vec<(&'static str, i64, &'static str)> {
    vec![
        (
            "files-howto",
            0,
            "Opening a file for reading requires a path and access mode",
        ),
        (
            "files-howto",
            1,
            "Closing file handles promptly avoids descriptor exhaustion",
        ),
        (
            "files-howto",
            2,
            "Buffered readers amortize the cost of small reads",
        ),
        (
            "net-guide",
            0,
            "Sockets expose a stream of bytes between two endpoints",
        ),
        (
            "net-guide",
            1,
            "Timeouts prevent a stalled peer from blocking the caller forever",
        ),
    ]
}

/// A generated corpus large enough to make exhaustive stages do real work
pub fn large_corpus(chunks: usize) -> Vec<(String, i64, String)> {
    let topics = [
        "database indexing strategies and query planners",
        "memory allocation arenas and fragmentation",
        "asynchronous runtimes and task scheduling",
        "compression codecs and entropy coding",
        "network protocols and congestion control",
        "parser combinators and grammar design",
        "cache coherence and memory ordering",
        "error propagation and recovery policies",
    ];

    (0..chunks)
        .map(|i| {
            let topic = topics[i % topics.len()];
            (
                format!("source-{}", i / 16),
                (i % 16) as i64,
                format!(
                    "Chunk {} discusses {} with worked examples and edge case number {}",
                    i,
                    topic,
                    i * 7 % 101
                ),
            )
        })
        .collect()
}
