//! Embedded SQLite store - the single source of truth for conversations,
//! messages, configuration and the RAG corpus.
//!
//! One file, WAL journal, foreign keys on. All writers go through the shared
//! pool and serialize inside the process; readers observe consistent
//! snapshots. Each table family gets its own store type over the shared
//! pool.

pub mod config_store;
pub mod conversation_store;
pub mod document_store;
pub mod legacy;
pub mod memory_store;
pub mod migration;
pub mod schema;

pub use config_store::ConfigStore;
pub use conversation_store::ConversationStore;
pub use document_store::DocumentStore;
pub use memory_store::MemoryStore;
pub use migration::MigrationManager;
pub use schema::*;

use std::path::Path;
use std::sync::Arc;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

pub type SqlitePool = Arc<Pool<SqliteConnectionManager>>;

pub struct Store {
    pub conversations: ConversationStore,
    pub documents: DocumentStore,
    pub memories: MemoryStore,
    pub config: ConfigStore,
    pool: SqlitePool,
}

impl Store {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        info!("opening store at {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            });
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }

        let pool = Arc::new(pool);
        info!("store ready");
        Ok(Self::from_pool(pool))
    }

    /// In-memory store for tests. A single shared connection keeps every
    /// handle on the same database.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")
        });
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self::from_pool(Arc::new(pool)))
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            conversations: ConversationStore::new(Arc::clone(&pool)),
            documents: DocumentStore::new(Arc::clone(&pool)),
            memories: MemoryStore::new(Arc::clone(&pool)),
            config: ConfigStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    pub fn pool(&self) -> SqlitePool {
        Arc::clone(&self.pool)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

pub(crate) fn get_conn(
    pool: &SqlitePool,
) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
    pool.get()
        .map_err(|e| anyhow::anyhow!("failed to get connection from pool: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_on_disk_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("data.db");
        {
            let store = Store::open(&db).unwrap();
            store
                .config
                .set("defaultModel", "\"deepseek-chat\"")
                .unwrap();
        }
        let store = Store::open(&db).unwrap();
        assert_eq!(
            store.config.get("defaultModel").unwrap().as_deref(),
            Some("\"deepseek-chat\"")
        );
    }

    #[test]
    fn test_in_memory_store_is_migrated() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.conversations.list_active().unwrap().is_empty());
    }
}
