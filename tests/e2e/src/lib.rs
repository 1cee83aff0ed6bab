//! End-to-End Test Harness
//!
//! Isolated engine instances for integration testing:
//! - Temporary data directories, cleaned up on drop
//! - Pre-seeded corpora
//! - The deterministic fallback embedding backend, so no test downloads a
//!   model or touches the network

pub mod fixtures;
pub mod harness;

pub use fixtures::{fox_corpus, large_corpus, prose_corpus};
pub use harness::TestEngine;
