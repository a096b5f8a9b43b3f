//! Versioned, re-runnable schema migrations.
//!
//! Applied versions are recorded in `schema_version`; every step is also
//! written so that running it against an already-migrated database changes
//! nothing.

use rusqlite::{Connection, OptionalExtension, Result};
use tracing::{info, warn};

use crate::store::schema;

pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    pub fn initialize_database(&mut self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.current_version()?;
        info!("database schema version: {}", current_version);
        self.apply_migrations(current_version)
    }

    pub fn current_version(&self) -> Result<i32> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .or(Ok(0))
    }

    pub fn has_migration_applied(&self, version: i32) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM schema_version WHERE version = ?",
                [version],
                |_| Ok(1),
            )
            .optional()
            .map(|row| row.is_some())
    }

    fn apply_migrations(&mut self, current_version: i32) -> Result<()> {
        for version in (current_version + 1)..=LATEST_VERSION {
            info!("applying migration {}...", version);

            // The documents rebuild drops and recreates a parent table;
            // enforcement must be off so the implicit deletes cannot
            // cascade into surviving chunks.
            let toggles_fk = version == 2;
            if toggles_fk {
                self.conn.pragma_update(None, "foreign_keys", "OFF")?;
            }

            let apply = |conn: &mut Connection| -> Result<()> {
                let tx = conn.transaction()?;
                match version {
                    1 => tx.execute_batch(schema::SCHEMA_SQL)?,
                    2 => migrate_strip_repo_scan(&tx)?,
                    3 => migrate_add_folder_column(&tx)?,
                    4 => tx.execute_batch(INDEX_SQL)?,
                    other => {
                        warn!("unknown migration version {}, skipping", other);
                    }
                }
                tx.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
                tx.commit()
            };
            let result = apply(self.conn);

            if toggles_fk {
                self.conn.pragma_update(None, "foreign_keys", "ON")?;
            }
            result?;
            info!("migration {} applied", version);
        }
        Ok(())
    }
}

pub const LATEST_VERSION: i32 = 4;

const INDEX_SQL: &str = "
CREATE INDEX IF NOT EXISTS idx_conversations_status ON conversations (status, updated_at);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages (conversation_id, created_at);
CREATE INDEX IF NOT EXISTS idx_documents_source_type ON documents (source_type);
CREATE INDEX IF NOT EXISTS idx_documents_folder ON documents (folder);
CREATE INDEX IF NOT EXISTS idx_memories_category ON memories (category);
CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks (document_id);
";

/// Earlier builds allowed a `repo_scan` source type, baked into the
/// documents CHECK constraint. Rows are migrated through a shadow table
/// carrying the clean constraint; repo-scan documents are dropped along
/// with their chunks and embeddings. Skips itself when the table is
/// already clean, so a re-run is a no-op.
fn migrate_strip_repo_scan(tx: &rusqlite::Transaction<'_>) -> Result<()> {
    let table_sql: Option<String> = tx
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'documents'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    let Some(table_sql) = table_sql else {
        return Ok(());
    };
    if !table_sql.contains("repo_scan") {
        return Ok(());
    }

    let stale: i64 = tx.query_row(
        "SELECT COUNT(*) FROM documents WHERE source_type = 'repo_scan'",
        [],
        |row| row.get(0),
    )?;
    info!("rebuilding documents table, dropping {} repo_scan row(s)", stale);

    tx.execute_batch(
        "CREATE TABLE documents_clean (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            source_type TEXT NOT NULL CHECK(source_type IN ('upload', 'manual')),
            source_uri TEXT,
            mime_type TEXT,
            created_at TIMESTAMP NOT NULL
        );
        INSERT INTO documents_clean
            SELECT id, title, source_type, source_uri, mime_type, created_at
            FROM documents WHERE source_type != 'repo_scan';
        DELETE FROM chunks WHERE document_id NOT IN (SELECT id FROM documents_clean);
        DELETE FROM embeddings WHERE chunk_id NOT IN (SELECT id FROM chunks);
        DROP TABLE documents;
        ALTER TABLE documents_clean RENAME TO documents;",
    )
}

fn migrate_add_folder_column(tx: &rusqlite::Transaction<'_>) -> Result<()> {
    let has_folder = {
        let mut stmt = tx.prepare("PRAGMA table_info(documents)")?;
        let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
        let mut found = false;
        for name in names {
            if name? == "folder" {
                found = true;
            }
        }
        found
    };
    if !has_folder {
        tx.execute("ALTER TABLE documents ADD COLUMN folder TEXT", [])?;
    }
    Ok(())
}
