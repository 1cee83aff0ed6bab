//! Chunk module - Core types and data structures
//!
//! Implements the document model for the retrieval engine:
//! - Document chunks with content hashes and source references
//! - Dense embeddings tagged with their producing model
//! - Ranked search results with strategy tags and stage annotations

mod result;

pub use result::{SearchResult, StageAnnotations, Strategy};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// CONTENT HASHING
// ============================================================================

/// Compute the SHA-256 content hash for a chunk's textual payload.
///
/// Two chunks with identical content share a hash; the store keeps at most
/// one row per hash.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex_encode(hasher.finalize().as_slice())
}

/// Lowercase hex encoding (used for content hashes and cache file names)
pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

// ============================================================================
// SOURCE KIND
// ============================================================================

/// Where a chunk's source document came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A crawled web page
    Web,
    /// A local file or imported document
    #[default]
    Document,
    /// A pasted note or snippet
    Note,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::Web => write!(f, "web"),
            SourceKind::Document => write!(f, "document"),
            SourceKind::Note => write!(f, "note"),
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "web" => Ok(SourceKind::Web),
            "document" => Ok(SourceKind::Document),
            "note" => Ok(SourceKind::Note),
            _ => Err(format!("Unknown source kind: {}", s)),
        }
    }
}

// ============================================================================
// CHUNK METADATA
// ============================================================================

/// Optional metadata carried by a chunk
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    /// Title of the source document
    pub title: Option<String>,
    /// Source URL for web content
    pub url: Option<String>,
    /// ISO 639-1 language code
    pub language: Option<String>,
    /// When the source content was created
    pub created_at: Option<DateTime<Utc>>,
    /// Whether the chunk contains code
    pub has_code: bool,
    /// Kind of source the chunk came from
    pub source_kind: SourceKind,
}

// ============================================================================
// CHUNK INPUT / DOCUMENT CHUNK
// ============================================================================

/// Input for ingesting a single chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkInput {
    /// Identifier of the source document this chunk belongs to
    pub source_id: String,
    /// Raw chunk text
    pub content: String,
    /// Position of this chunk within its source
    pub chunk_index: i64,
    /// Optional metadata
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

/// A contiguous slice of a source document, indexed as an atomic unit
///
/// Chunks are append-only once indexed; deletes cascade from source removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChunk {
    /// Stable identifier (UUID v4)
    pub id: String,
    /// Identifier of the source document
    pub source_id: String,
    /// Raw chunk text
    pub content: String,
    /// Position of this chunk within its source
    pub chunk_index: i64,
    /// SHA-256 hash of `content`
    pub content_hash: String,
    /// Metadata
    pub metadata: ChunkMetadata,
    /// When the chunk was ingested
    pub ingested_at: DateTime<Utc>,
    /// Model id of the stored embedding, if one exists
    pub embedding_model: Option<String>,
}

impl DocumentChunk {
    /// Byte size of the chunk payload (used by the document cache tier)
    pub fn payload_bytes(&self) -> usize {
        self.content.len()
            + self.id.len()
            + self.source_id.len()
            + self.metadata.title.as_deref().map_or(0, str::len)
            + self.metadata.url.as_deref().map_or(0, str::len)
    }
}

// ============================================================================
// TESTS
// ============================================================================
