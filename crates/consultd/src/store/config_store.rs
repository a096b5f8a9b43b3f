//! Key/value configuration rows.

use rusqlite::{params, OptionalExtension};

use crate::store::{get_conn, SqlitePool};

pub struct ConfigStore {
    pool: SqlitePool,
}

impl ConfigStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = get_conn(&self.pool)?;
        conn.query_row("SELECT value FROM config WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(Into::into)
    }

    pub fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let conn = get_conn(&self.pool)?;
        conn.execute(
            "INSERT OR REPLACE INTO config (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Upsert several keys in one transaction so a partial write never
    /// becomes visible.
    pub fn set_many(&self, entries: &[(String, String)]) -> anyhow::Result<()> {
        let mut conn = get_conn(&self.pool)?;
        let tx = conn.transaction()?;
        for (key, value) in entries {
            tx.execute(
                "INSERT OR REPLACE INTO config (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn all(&self) -> anyhow::Result<Vec<(String, String)>> {
        let conn = get_conn(&self.pool)?;
        let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use crate::store::Store;

    #[test]
    fn test_set_get_replace() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.config.get("maxMessages").unwrap().is_none());
        store.config.set("maxMessages", "5").unwrap();
        store.config.set("maxMessages", "7").unwrap();
        assert_eq!(store.config.get("maxMessages").unwrap().as_deref(), Some("7"));
    }

    #[test]
    fn test_set_many_is_atomic_snapshot() {
        let store = Store::open_in_memory().unwrap();
        store
            .config
            .set_many(&[
                ("a".into(), "1".into()),
                ("b".into(), "2".into()),
            ])
            .unwrap();
        let all = store.config.all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], ("a".to_string(), "1".to_string()));
    }
}
