//! SQLite Chunk Store
//!
//! Source of truth for chunks and their embeddings. Uses separate
//! reader/writer connections for interior mutability so the store is
//! `Send + Sync` and shared by `Arc` without an outer lock.

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use crate::chunk::{content_hash, ChunkInput, DocumentChunk};
use crate::embeddings::Embedding;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Chunk store error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Chunk not found
    #[error("Chunk not found: {0}")]
    NotFound(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

/// Chunk store result type
pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ============================================================================
// CHUNK STORE
// ============================================================================

/// SQLite-backed chunk store
pub struct ChunkStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    path: PathBuf,
}

impl ChunkStore {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) the store at the given path
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let writer = Connection::open(db_path)?;
        Self::configure_connection(&writer)?;
        super::migrations::apply_migrations(&writer)?;

        let reader = Connection::open(db_path)?;
        Self::configure_connection(&reader)?;

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            path: db_path.to_path_buf(),
        })
    }

    /// Open in the default per-user data directory (`docs.db`)
    pub fn open_default() -> StoreResult<Self> {
        let proj_dirs = ProjectDirs::from("io", "trove", "core").ok_or_else(|| {
            StoreError::Init("could not determine project directories".to_string())
        })?;
        let data_dir = proj_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;
        Self::open(&data_dir.join("docs.db"))
    }

    /// Path to the underlying database file
    pub fn db_path(&self) -> &Path {
        &self.path
    }

    fn write(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StoreError::Init("writer lock poisoned".to_string()))
    }

    fn read(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| StoreError::Init("reader lock poisoned".to_string()))
    }

    // ========================================================================
    // INGESTION
    // ========================================================================

    /// Insert a chunk, deduplicating on content hash.
    ///
    /// Two chunks with identical content share a hash and at most one row is
    /// stored; re-adding existing content returns the stored chunk.
    pub fn add_chunk(&self, input: &ChunkInput) -> StoreResult<DocumentChunk> {
        let hash = content_hash(&input.content);

        if let Some(existing) = self.get_chunk_by_hash(&hash)? {
            return Ok(existing);
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        {
            let writer = self.write()?;
            writer.execute(
                "INSERT INTO chunks (
                    id, source_id, chunk_index, content, content_hash,
                    title, url, language, source_kind, has_code, created_at,
                    ingested_at, embedding_model
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    id,
                    input.source_id,
                    input.chunk_index,
                    input.content,
                    hash,
                    input.metadata.title,
                    input.metadata.url,
                    input.metadata.language,
                    input.metadata.source_kind.to_string(),
                    input.metadata.has_code as i64,
                    input.metadata.created_at.map(|dt| dt.to_rfc3339()),
                    now.to_rfc3339(),
                    Option::<String>::None,
                ],
            )?;
        }

        self.get_chunk(&id)?
            .ok_or_else(|| StoreError::NotFound(id))
    }

    /// Insert a batch of chunks, deduplicating each
    pub fn add_chunks_batch(&self, inputs: &[ChunkInput]) -> StoreResult<Vec<DocumentChunk>> {
        let mut chunks = Vec::with_capacity(inputs.len());
        for input in inputs {
            chunks.push(self.add_chunk(input)?);
        }
        Ok(chunks)
    }

    /// Remove all chunks of a source; embeddings and FTS rows cascade.
    ///
    /// Returns how many chunks were removed.
    pub fn remove_source(&self, source_id: &str) -> StoreResult<usize> {
        let writer = self.write()?;
        let removed = writer.execute("DELETE FROM chunks WHERE source_id = ?1", params![source_id])?;
        Ok(removed)
    }

    // ========================================================================
    // LOOKUP
    // ========================================================================

    fn row_to_chunk(row: &Row<'_>) -> rusqlite::Result<DocumentChunk> {
        let created_at: Option<String> = row.get(10)?;
        let ingested_at: String = row.get(11)?;
        Ok(DocumentChunk {
            id: row.get(0)?,
            source_id: row.get(1)?,
            chunk_index: row.get(2)?,
            content: row.get(3)?,
            content_hash: row.get(4)?,
            metadata: crate::chunk::ChunkMetadata {
                title: row.get(5)?,
                url: row.get(6)?,
                language: row.get(7)?,
                source_kind: row.get::<_, String>(8)?.parse().unwrap_or_default(),
                has_code: row.get::<_, i64>(9)? != 0,
                created_at: created_at
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
            },
            ingested_at: DateTime::parse_from_rfc3339(&ingested_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            embedding_model: row.get(12)?,
        })
    }

    const CHUNK_COLUMNS: &'static str = "id, source_id, chunk_index, content, content_hash, \
         title, url, language, source_kind, has_code, created_at, ingested_at, embedding_model";

    /// Fetch a chunk by id
    pub fn get_chunk(&self, id: &str) -> StoreResult<Option<DocumentChunk>> {
        let reader = self.read()?;
        let chunk = reader
            .query_row(
                &format!("SELECT {} FROM chunks WHERE id = ?1", Self::CHUNK_COLUMNS),
                params![id],
                Self::row_to_chunk,
            )
            .optional()?;
        Ok(chunk)
    }

    /// Fetch a chunk by content hash
    pub fn get_chunk_by_hash(&self, hash: &str) -> StoreResult<Option<DocumentChunk>> {
        let reader = self.read()?;
        let chunk = reader
            .query_row(
                &format!(
                    "SELECT {} FROM chunks WHERE content_hash = ?1",
                    Self::CHUNK_COLUMNS
                ),
                params![hash],
                Self::row_to_chunk,
            )
            .optional()?;
        Ok(chunk)
    }

    /// Previous and next chunks in the same source (by chunk index)
    pub fn neighbors(
        &self,
        chunk: &DocumentChunk,
    ) -> StoreResult<(Option<DocumentChunk>, Option<DocumentChunk>)> {
        let reader = self.read()?;
        let previous = reader
            .query_row(
                &format!(
                    "SELECT {} FROM chunks WHERE source_id = ?1 AND chunk_index = ?2",
                    Self::CHUNK_COLUMNS
                ),
                params![chunk.source_id, chunk.chunk_index - 1],
                Self::row_to_chunk,
            )
            .optional()?;
        let next = reader
            .query_row(
                &format!(
                    "SELECT {} FROM chunks WHERE source_id = ?1 AND chunk_index = ?2",
                    Self::CHUNK_COLUMNS
                ),
                params![chunk.source_id, chunk.chunk_index + 1],
                Self::row_to_chunk,
            )
            .optional()?;
        Ok((previous, next))
    }

    /// Chunks that do not yet have a stored embedding (for precompute)
    pub fn chunks_missing_embeddings(&self, limit: usize) -> StoreResult<Vec<DocumentChunk>> {
        let reader = self.read()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM chunks
             WHERE id NOT IN (SELECT chunk_id FROM chunk_embeddings)
             ORDER BY ingested_at LIMIT ?1",
            Self::CHUNK_COLUMNS
        ))?;
        let chunks = stmt
            .query_map(params![limit as i64], Self::row_to_chunk)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(chunks)
    }

    /// All chunk ids belonging to a source (used for cascade bookkeeping in
    /// the vector index and cache)
    pub fn chunk_ids_for_source(&self, source_id: &str) -> StoreResult<Vec<String>> {
        let reader = self.read()?;
        let mut stmt =
            reader.prepare("SELECT id FROM chunks WHERE source_id = ?1 ORDER BY chunk_index")?;
        let ids = stmt
            .query_map(params![source_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// Number of stored chunks
    pub fn chunk_count(&self) -> StoreResult<i64> {
        let reader = self.read()?;
        Ok(reader.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?)
    }

    /// Number of distinct sources
    pub fn source_count(&self) -> StoreResult<i64> {
        let reader = self.read()?;
        Ok(reader.query_row(
            "SELECT COUNT(DISTINCT source_id) FROM chunks",
            [],
            |row| row.get(0),
        )?)
    }

    // ========================================================================
    // EMBEDDINGS
    // ========================================================================

    /// Store (or replace) a chunk's embedding
    pub fn put_embedding(&self, chunk_id: &str, embedding: &Embedding) -> StoreResult<()> {
        let writer = self.write()?;
        writer.execute(
            "INSERT OR REPLACE INTO chunk_embeddings
                 (chunk_id, embedding, dimensions, model_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                chunk_id,
                embedding.to_bytes(),
                embedding.dimensions() as i64,
                embedding.model_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        writer.execute(
            "UPDATE chunks SET embedding_model = ?2 WHERE id = ?1",
            params![chunk_id, embedding.model_id],
        )?;
        Ok(())
    }

    /// Fetch a chunk's stored embedding
    pub fn get_embedding(&self, chunk_id: &str) -> StoreResult<Option<Embedding>> {
        let reader = self.read()?;
        let row: Option<(Vec<u8>, String)> = reader
            .query_row(
                "SELECT embedding, model_id FROM chunk_embeddings WHERE chunk_id = ?1",
                params![chunk_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.and_then(|(bytes, model_id)| Embedding::from_bytes(&bytes, model_id)))
    }

    /// All stored embeddings with their chunk's source id.
    ///
    /// Feeds vector-index startup load and rebuild; malformed rows are
    /// skipped with a warning rather than failing the whole scan.
    pub fn all_embeddings(&self) -> StoreResult<Vec<(String, Option<String>, Embedding)>> {
        let reader = self.read()?;
        let mut stmt = reader.prepare(
            "SELECT e.chunk_id, c.source_id, e.embedding, e.model_id
             FROM chunk_embeddings e JOIN chunks c ON c.id = e.chunk_id",
        )?;
        let rows: Vec<(String, String, Vec<u8>, String)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .filter_map(|r| r.ok())
            .collect();

        let mut out = Vec::with_capacity(rows.len());
        for (chunk_id, source_id, bytes, model_id) in rows {
            match Embedding::from_bytes(&bytes, model_id) {
                Some(embedding) => out.push((chunk_id, Some(source_id), embedding)),
                None => tracing::warn!("skipping malformed embedding row for {}", chunk_id),
            }
        }
        Ok(out)
    }

    /// Number of chunks with stored embeddings
    pub fn embedding_count(&self) -> StoreResult<i64> {
        let reader = self.read()?;
        Ok(reader.query_row("SELECT COUNT(*) FROM chunk_embeddings", [], |row| row.get(0))?)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkMetadata;

    fn temp_store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::open(&dir.path().join("docs.db")).unwrap();
        (dir, store)
    }

    fn input(source: &str, index: i64, content: &str) -> ChunkInput {
        ChunkInput {
            source_id: source.to_string(),
            content: content.to_string(),
            chunk_index: index,
            metadata: ChunkMetadata::default(),
        }
    }

    #[test]
    fn test_add_and_get_chunk() {
        let (_dir, store) = temp_store();
        let chunk = store.add_chunk(&input("s1", 0, "hello world")).unwrap();

        let fetched = store.get_chunk(&chunk.id).unwrap().unwrap();
        assert_eq!(fetched.content, "hello world");
        assert_eq!(fetched.content_hash, content_hash("hello world"));
    }

    #[test]
    fn test_content_hash_dedup() {
        let (_dir, store) = temp_store();
        let first = store.add_chunk(&input("s1", 0, "same content")).unwrap();
        let second = store.add_chunk(&input("s2", 5, "same content")).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.chunk_count().unwrap(), 1);
    }

    #[test]
    fn test_remove_source_cascades() {
        let (_dir, store) = temp_store();
        let chunk = store.add_chunk(&input("s1", 0, "to be removed")).unwrap();
        store
            .put_embedding(&chunk.id, &Embedding::new(vec![0.1, 0.2], "m"))
            .unwrap();
        store.add_chunk(&input("s2", 0, "survivor")).unwrap();

        let removed = store.remove_source("s1").unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.chunk_count().unwrap(), 1);
        assert!(store.get_embedding(&chunk.id).unwrap().is_none());
    }

    #[test]
    fn test_neighbors() {
        let (_dir, store) = temp_store();
        store.add_chunk(&input("s1", 0, "first part")).unwrap();
        let middle = store.add_chunk(&input("s1", 1, "second part")).unwrap();
        store.add_chunk(&input("s1", 2, "third part")).unwrap();

        let (prev, next) = store.neighbors(&middle).unwrap();
        assert_eq!(prev.unwrap().content, "first part");
        assert_eq!(next.unwrap().content, "third part");
    }

    #[test]
    fn test_neighbors_at_edges() {
        let (_dir, store) = temp_store();
        let only = store.add_chunk(&input("s1", 0, "lonely chunk")).unwrap();
        let (prev, next) = store.neighbors(&only).unwrap();
        assert!(prev.is_none());
        assert!(next.is_none());
    }

    #[test]
    fn test_embedding_round_trip() {
        let (_dir, store) = temp_store();
        let chunk = store.add_chunk(&input("s1", 0, "embed me")).unwrap();
        let embedding = Embedding::new(vec![0.3, 0.4, 0.5], "test-model");

        store.put_embedding(&chunk.id, &embedding).unwrap();
        let fetched = store.get_embedding(&chunk.id).unwrap().unwrap();

        assert_eq!(fetched.model_id, "test-model");
        assert_eq!(fetched.vector.len(), 3);

        let updated = store.get_chunk(&chunk.id).unwrap().unwrap();
        assert_eq!(updated.embedding_model.as_deref(), Some("test-model"));
    }

    #[test]
    fn test_chunks_missing_embeddings() {
        let (_dir, store) = temp_store();
        let a = store.add_chunk(&input("s1", 0, "has embedding")).unwrap();
        store.add_chunk(&input("s1", 1, "missing embedding")).unwrap();
        store
            .put_embedding(&a.id, &Embedding::new(vec![1.0], "m"))
            .unwrap();

        let missing = store.chunks_missing_embeddings(10).unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].content, "missing embedding");
    }

    #[test]
    fn test_counts() {
        let (_dir, store) = temp_store();
        store.add_chunk(&input("s1", 0, "one")).unwrap();
        store.add_chunk(&input("s1", 1, "two")).unwrap();
        store.add_chunk(&input("s2", 0, "three")).unwrap();

        assert_eq!(store.chunk_count().unwrap(), 3);
        assert_eq!(store.source_count().unwrap(), 2);
    }
}
