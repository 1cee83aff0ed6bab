//! Store Module
//!
//! SQLite-based chunk store:
//! - Append-only document chunks with content-hash dedup
//! - FTS5 full-text table (external content, trigger-synced)
//! - Embedding rows (raw little-endian f32 blobs) as the vector index's
//!   source of truth
//! - Source-level cascade removal

mod migrations;
mod sqlite;

pub use migrations::MIGRATIONS;
pub use sqlite::{ChunkStore, StoreError, StoreResult};
