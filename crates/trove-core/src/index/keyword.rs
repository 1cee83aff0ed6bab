//! Keyword Index
//!
//! Ranked full-text retrieval over chunk content plus title and source URL
//! side-columns, backed by the chunk store's FTS5 table (external-content,
//! `porter unicode61` tokenizer, kept in sync by triggers so indexing is
//! transactional with chunk writes).
//!
//! Scores come from FTS5's `bm25()` with column weights; higher is better
//! after negation (SQLite returns smaller-is-better values).

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::chunk::{ChunkMetadata, SourceKind};
use crate::store::{StoreError, StoreResult};

// ============================================================================
// QUERY SANITIZATION
// ============================================================================

/// Sanitize raw tokens into an FTS5 MATCH expression.
///
/// Each token is double-quoted (neutralizing FTS5 operators like `NEAR`,
/// `*`, `-`, and column filters) and tokens are OR-joined for recall; BM25
/// ranking rewards documents matching more of them.
pub fn sanitize_fts_query(tokens: &[String]) -> String {
    let quoted: Vec<String> = tokens
        .iter()
        .filter(|t| !t.trim().is_empty())
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    quoted.join(" OR ")
}

// ============================================================================
// FILTERS & HITS
// ============================================================================

/// Metadata filters applied inside the keyword query
#[derive(Debug, Clone, Default)]
pub struct KeywordFilters {
    /// Restrict to a source kind
    pub source_kind: Option<SourceKind>,
    /// Restrict to an ISO 639-1 language code
    pub language: Option<String>,
    /// Restrict to content created at or after this instant
    pub created_after: Option<DateTime<Utc>>,
    /// Restrict to content created before this instant
    pub created_before: Option<DateTime<Utc>>,
}

/// A ranked keyword hit
#[derive(Debug, Clone)]
pub struct KeywordHit {
    /// Chunk id
    pub id: String,
    /// Chunk content
    pub content: String,
    /// Chunk metadata
    pub metadata: ChunkMetadata,
    /// BM25-style rank score (higher is better, unbounded)
    pub rank_score: f32,
}

// ============================================================================
// KEYWORD INDEX
// ============================================================================

/// Ranked full-text index over the chunk store's FTS5 table
pub struct KeywordIndex {
    conn: Mutex<Connection>,
}

impl KeywordIndex {
    /// Open against an already-migrated chunk database
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Ranked lookup. `tokens` arrive pre-filtered by the pipeline (the
    /// pipeline drops tokens shorter than 3 chars, not this component).
    pub fn query(
        &self,
        tokens: &[String],
        k: usize,
        filters: &KeywordFilters,
    ) -> StoreResult<Vec<KeywordHit>> {
        let match_expr = sanitize_fts_query(tokens);
        if match_expr.is_empty() || k == 0 {
            return Ok(vec![]);
        }

        let mut sql = String::from(
            "SELECT c.id, c.content, c.title, c.url, c.language, c.source_kind,
                    c.has_code, c.created_at,
                    -bm25(chunk_fts, 1.0, 4.0, 2.0) AS rank_score
             FROM chunk_fts
             JOIN chunks c ON c.rowid = chunk_fts.rowid
             WHERE chunk_fts MATCH ?1",
        );

        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(match_expr)];

        if let Some(kind) = filters.source_kind {
            params.push(Box::new(kind.to_string()));
            sql.push_str(&format!(" AND c.source_kind = ?{}", params.len()));
        }
        if let Some(lang) = &filters.language {
            params.push(Box::new(lang.clone()));
            sql.push_str(&format!(" AND c.language = ?{}", params.len()));
        }
        if let Some(after) = filters.created_after {
            params.push(Box::new(after.to_rfc3339()));
            sql.push_str(&format!(" AND c.created_at >= ?{}", params.len()));
        }
        if let Some(before) = filters.created_before {
            params.push(Box::new(before.to_rfc3339()));
            sql.push_str(&format!(" AND c.created_at < ?{}", params.len()));
        }

        params.push(Box::new(k as i64));
        sql.push_str(&format!(
            " ORDER BY rank_score DESC LIMIT ?{}",
            params.len()
        ));

        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Init("keyword index lock poisoned".to_string()))?;

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let hits = stmt
            .query_map(param_refs.as_slice(), |row| {
                let created_at: Option<String> = row.get(7)?;
                Ok(KeywordHit {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    metadata: ChunkMetadata {
                        title: row.get(2)?,
                        url: row.get(3)?,
                        language: row.get(4)?,
                        source_kind: row
                            .get::<_, String>(5)?
                            .parse()
                            .unwrap_or_default(),
                        has_code: row.get::<_, i64>(6)? != 0,
                        created_at: created_at
                            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                            .map(|dt| dt.with_timezone(&Utc)),
                    },
                    rank_score: row.get::<_, f64>(8)? as f32,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(hits)
    }

    /// Rebuild the FTS index from the chunks table.
    ///
    /// FTS5's `'rebuild'` command replaces the index contents inside the
    /// surrounding transaction, so concurrent readers never observe a
    /// partial rebuild. Idempotent.
    pub fn reindex_all(&self) -> StoreResult<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Init("keyword index lock poisoned".to_string()))?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO chunk_fts(chunk_fts) VALUES('rebuild')",
            [],
        )?;
        tx.commit()?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
