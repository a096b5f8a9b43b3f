//! Structured memory notes. The retrievable mirror document is produced by
//! the RAG pipeline, not here.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::store::schema::{MemoryCategory, MemoryNote};
use crate::store::{get_conn, SqlitePool};

pub struct MemoryStore {
    pool: SqlitePool,
}

impl MemoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn create(
        &self,
        category: MemoryCategory,
        title: &str,
        content: &str,
    ) -> anyhow::Result<MemoryNote> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = get_conn(&self.pool)?;
        conn.execute(
            "INSERT INTO memories (id, category, title, content, source, created_at)
             VALUES (?1, ?2, ?3, ?4, 'manual', ?5)",
            params![&id, category.as_str(), title, content, now.to_rfc3339()],
        )?;
        Ok(MemoryNote {
            id,
            category,
            title: title.to_string(),
            content: content.to_string(),
            source: "manual".to_string(),
            created_at: now,
        })
    }

    pub fn get(&self, id: &str) -> anyhow::Result<Option<MemoryNote>> {
        let conn = get_conn(&self.pool)?;
        conn.query_row(
            "SELECT id, category, title, content, source, created_at FROM memories WHERE id = ?1",
            [id],
            row_to_memory,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list(&self, category: Option<MemoryCategory>) -> anyhow::Result<Vec<MemoryNote>> {
        let conn = get_conn(&self.pool)?;
        let mut out = Vec::new();
        match category {
            Some(category) => {
                let mut stmt = conn.prepare(
                    "SELECT id, category, title, content, source, created_at
                     FROM memories WHERE category = ?1 ORDER BY created_at DESC",
                )?;
                let mut rows = stmt.query([category.as_str()])?;
                while let Some(row) = rows.next()? {
                    out.push(row_to_memory(row)?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, category, title, content, source, created_at
                     FROM memories ORDER BY created_at DESC",
                )?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    out.push(row_to_memory(row)?);
                }
            }
        }
        Ok(out)
    }
}

fn row_to_memory(row: &Row) -> rusqlite::Result<MemoryNote> {
    let category: String = row.get(1)?;
    let created_at: String = row.get(5)?;
    Ok(MemoryNote {
        id: row.get(0)?,
        category: MemoryCategory::parse(&category).unwrap_or(MemoryCategory::Other),
        title: row.get(2)?,
        content: row.get(3)?,
        source: row.get(4)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn test_create_and_filter_by_category() {
        let store = Store::open_in_memory().unwrap();
        store
            .memories
            .create(MemoryCategory::Auth, "token flow", "lock token gates /api")
            .unwrap();
        store
            .memories
            .create(MemoryCategory::Db, "wal", "store runs in WAL mode")
            .unwrap();

        assert_eq!(store.memories.list(None).unwrap().len(), 2);
        let auth = store.memories.list(Some(MemoryCategory::Auth)).unwrap();
        assert_eq!(auth.len(), 1);
        assert_eq!(auth[0].title, "token flow");
        assert_eq!(auth[0].source, "manual");
    }
}
