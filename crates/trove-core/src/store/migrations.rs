//! Database Migrations
//!
//! Schema migration definitions for the chunk store.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Initial schema: chunks, FTS5 keyword index, embeddings",
    up: MIGRATION_V1_UP,
}];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL UNIQUE,

    -- Side columns surfaced to the keyword index
    title TEXT,
    url TEXT,
    language TEXT,
    source_kind TEXT NOT NULL DEFAULT 'document',
    has_code INTEGER NOT NULL DEFAULT 0,
    created_at TEXT,

    ingested_at TEXT NOT NULL,
    embedding_model TEXT
);

CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source_id, chunk_index);
CREATE INDEX IF NOT EXISTS idx_chunks_hash ON chunks(content_hash);
CREATE INDEX IF NOT EXISTS idx_chunks_created ON chunks(created_at);

-- Embeddings storage (binary blob, little-endian f32)
CREATE TABLE IF NOT EXISTS chunk_embeddings (
    chunk_id TEXT PRIMARY KEY REFERENCES chunks(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    model_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- FTS5 keyword index over content + title + url side columns.
-- porter unicode61: unicode-aware case folding with light stemming.
CREATE VIRTUAL TABLE IF NOT EXISTS chunk_fts USING fts5(
    content, title, url,
    content='chunks',
    content_rowid='rowid',
    tokenize='porter unicode61'
);

-- Triggers keep FTS in sync so keyword indexing is transactional with
-- chunk writes
CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
    INSERT INTO chunk_fts(rowid, content, title, url)
    VALUES (NEW.rowid, NEW.content, NEW.title, NEW.url);
END;

CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
    INSERT INTO chunk_fts(chunk_fts, rowid, content, title, url)
    VALUES ('delete', OLD.rowid, OLD.content, OLD.title, OLD.url);
END;

CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
    INSERT INTO chunk_fts(chunk_fts, rowid, content, title, url)
    VALUES ('delete', OLD.rowid, OLD.content, OLD.title, OLD.url);
    INSERT INTO chunk_fts(rowid, content, title, url)
    VALUES (NEW.rowid, NEW.content, NEW.title, NEW.url);
END;

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// Get the current schema version (0 when the version table is absent)
fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let table_exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !table_exists {
        return Ok(0);
    }

    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

/// Apply all pending migrations; returns how many were applied
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}
