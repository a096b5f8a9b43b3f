//! Documents, chunks and embedding vectors.
//!
//! Deleting a document cascades to its chunks and their vectors; an
//! embedding insert replaces any previous vector for the chunk.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::schema::*;
use crate::store::{get_conn, SqlitePool};

pub struct DocumentStore {
    pool: SqlitePool,
}

/// A chunk hydrated with its vector and parent-document labels, as the
/// retrieval scan consumes it.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i32,
    pub content: String,
    pub title: String,
    pub source_type: SourceType,
    pub folder: Option<String>,
    pub vector: Vec<u8>,
}

impl DocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn create_document(
        &self,
        title: &str,
        source_type: SourceType,
        source_uri: Option<&str>,
        mime_type: Option<&str>,
        folder: Option<&str>,
    ) -> anyhow::Result<Document> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = get_conn(&self.pool)?;
        conn.execute(
            "INSERT INTO documents (id, title, source_type, source_uri, mime_type, folder, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &id,
                title,
                source_type.as_str(),
                source_uri,
                mime_type,
                folder,
                now.to_rfc3339()
            ],
        )?;
        debug!("created document '{}' ({})", title, id);
        Ok(Document {
            id,
            title: title.to_string(),
            source_type,
            source_uri: source_uri.map(str::to_string),
            mime_type: mime_type.map(str::to_string),
            folder: folder.map(str::to_string),
            created_at: now,
        })
    }

    pub fn get_document(&self, id: &str) -> anyhow::Result<Option<Document>> {
        let conn = get_conn(&self.pool)?;
        conn.query_row(
            "SELECT id, title, source_type, source_uri, mime_type, folder, created_at
             FROM documents WHERE id = ?1",
            [id],
            row_to_document,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_documents(&self, folder: Option<&str>) -> anyhow::Result<Vec<Document>> {
        let conn = get_conn(&self.pool)?;
        let mut out = Vec::new();
        match folder {
            Some(folder) => {
                let mut stmt = conn.prepare(
                    "SELECT id, title, source_type, source_uri, mime_type, folder, created_at
                     FROM documents WHERE folder = ?1 ORDER BY created_at DESC",
                )?;
                let mut rows = stmt.query([folder])?;
                while let Some(row) = rows.next()? {
                    out.push(row_to_document(row)?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, title, source_type, source_uri, mime_type, folder, created_at
                     FROM documents ORDER BY created_at DESC",
                )?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    out.push(row_to_document(row)?);
                }
            }
        }
        Ok(out)
    }

    /// Documents whose trimmed title matches case-insensitively. Duplicate
    /// detection for batch upload is exactly this coarse on purpose.
    pub fn find_by_title(&self, title: &str) -> anyhow::Result<Vec<Document>> {
        let needle = title.trim().to_lowercase();
        Ok(self
            .list_documents(None)?
            .into_iter()
            .filter(|doc| doc.title.trim().to_lowercase() == needle)
            .collect())
    }

    pub fn delete_document(&self, id: &str) -> anyhow::Result<usize> {
        let conn = get_conn(&self.pool)?;
        let deleted = conn.execute("DELETE FROM documents WHERE id = ?1", [id])?;
        if deleted > 0 {
            info!("deleted document {}", id);
        }
        Ok(deleted)
    }

    /// Insert a document's chunks in one transaction. Indices are the
    /// 0-based positions of `contents`.
    pub fn insert_chunks(
        &self,
        document_id: &str,
        contents: &[(String, i32)],
    ) -> anyhow::Result<Vec<Chunk>> {
        let mut conn = get_conn(&self.pool)?;
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let tx = conn.transaction()?;
        let mut chunks = Vec::with_capacity(contents.len());
        for (index, (content, token_count)) in contents.iter().enumerate() {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO chunks (id, document_id, chunk_index, content, token_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![&id, document_id, index as i32, content, token_count, &now_str],
            )?;
            chunks.push(Chunk {
                id,
                document_id: document_id.to_string(),
                chunk_index: index as i32,
                content: content.clone(),
                token_count: *token_count,
                created_at: now,
            });
        }
        tx.commit()?;
        debug!("stored {} chunk(s) for document {}", chunks.len(), document_id);
        Ok(chunks)
    }

    pub fn chunks_for_document(&self, document_id: &str) -> anyhow::Result<Vec<Chunk>> {
        let conn = get_conn(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT id, document_id, chunk_index, content, token_count, created_at
             FROM chunks WHERE document_id = ?1 ORDER BY chunk_index",
        )?;
        let mut rows = stmt.query([document_id])?;
        let mut chunks = Vec::new();
        while let Some(row) = rows.next()? {
            chunks.push(row_to_chunk(row)?);
        }
        Ok(chunks)
    }

    pub fn all_chunks(&self) -> anyhow::Result<Vec<Chunk>> {
        let conn = get_conn(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT id, document_id, chunk_index, content, token_count, created_at
             FROM chunks ORDER BY document_id, chunk_index",
        )?;
        let mut rows = stmt.query([])?;
        let mut chunks = Vec::new();
        while let Some(row) = rows.next()? {
            chunks.push(row_to_chunk(row)?);
        }
        Ok(chunks)
    }

    /// At most one vector per chunk; inserting replaces.
    pub fn upsert_embedding(
        &self,
        chunk_id: &str,
        vector: &[u8],
        dim: i32,
        model: &str,
    ) -> anyhow::Result<()> {
        let conn = get_conn(&self.pool)?;
        conn.execute(
            "INSERT OR REPLACE INTO embeddings (chunk_id, vector, dim, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![chunk_id, vector, dim, model, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn embedding_count(&self) -> anyhow::Result<usize> {
        let conn = get_conn(&self.pool)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Retrieval candidates: every embedded chunk joined with its document
    /// labels, optionally narrowed to a document-id set and/or a folder.
    pub fn embedded_chunks(
        &self,
        doc_ids: Option<&[String]>,
        folder: Option<&str>,
    ) -> anyhow::Result<Vec<EmbeddedChunk>> {
        let conn = get_conn(&self.pool)?;
        let mut sql = String::from(
            "SELECT c.id, c.document_id, c.chunk_index, c.content,
                    d.title, d.source_type, d.folder, e.vector
             FROM chunks c
             JOIN documents d ON c.document_id = d.id
             JOIN embeddings e ON e.chunk_id = c.id
             WHERE 1=1",
        );
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(ids) = doc_ids {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; ids.len()].join(",");
            sql.push_str(&format!(" AND c.document_id IN ({})", placeholders));
            for id in ids {
                params_vec.push(Box::new(id.clone()));
            }
        }
        if let Some(folder) = folder {
            sql.push_str(" AND d.folder = ?");
            params_vec.push(Box::new(folder.to_string()));
        }
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
        let mut rows = stmt.query(rusqlite::params_from_iter(param_refs))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let source_type: String = row.get(5)?;
            out.push(EmbeddedChunk {
                chunk_id: row.get(0)?,
                document_id: row.get(1)?,
                chunk_index: row.get(2)?,
                content: row.get(3)?,
                title: row.get(4)?,
                source_type: SourceType::parse(&source_type).unwrap_or(SourceType::Upload),
                folder: row.get(6)?,
                vector: row.get(7)?,
            });
        }
        Ok(out)
    }

    pub fn list_folders(&self) -> anyhow::Result<Vec<String>> {
        let conn = get_conn(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT folder FROM documents WHERE folder IS NOT NULL ORDER BY folder",
        )?;
        let folders = stmt.query_map([], |row| row.get(0))?;
        folders.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Drop a folder label; its documents stay, unfiled.
    pub fn clear_folder(&self, folder: &str) -> anyhow::Result<usize> {
        let conn = get_conn(&self.pool)?;
        let moved = conn.execute(
            "UPDATE documents SET folder = NULL WHERE folder = ?1",
            [folder],
        )?;
        Ok(moved)
    }
}

fn parse_datetime(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_document(row: &Row) -> rusqlite::Result<Document> {
    let source_type: String = row.get(2)?;
    let created_at: String = row.get(6)?;
    Ok(Document {
        id: row.get(0)?,
        title: row.get(1)?,
        source_type: SourceType::parse(&source_type).unwrap_or(SourceType::Upload),
        source_uri: row.get(3)?,
        mime_type: row.get(4)?,
        folder: row.get(5)?,
        created_at: parse_datetime(&created_at),
    })
}

fn row_to_chunk(row: &Row) -> rusqlite::Result<Chunk> {
    let created_at: String = row.get(5)?;
    Ok(Chunk {
        id: row.get(0)?,
        document_id: row.get(1)?,
        chunk_index: row.get(2)?,
        content: row.get(3)?,
        token_count: row.get(4)?,
        created_at: parse_datetime(&created_at),
    })
}
