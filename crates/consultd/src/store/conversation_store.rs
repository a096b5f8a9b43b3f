//! Conversation and message persistence.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::schema::*;
use crate::store::{get_conn, SqlitePool};

pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn create(
        &self,
        model: &str,
        system_prompt: Option<&str>,
    ) -> anyhow::Result<Conversation> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = get_conn(&self.pool)?;
        conn.execute(
            "INSERT INTO conversations (id, model, system_prompt, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?4)",
            params![&id, model, system_prompt, now.to_rfc3339()],
        )?;
        debug!("created conversation {} for model {}", id, model);
        Ok(Conversation {
            id,
            model: model.to_string(),
            system_prompt: system_prompt.map(str::to_string),
            status: ConversationStatus::Active,
            end_reason: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        })
    }

    pub fn get(&self, id: &str) -> anyhow::Result<Option<Conversation>> {
        let conn = get_conn(&self.pool)?;
        conn.query_row(
            "SELECT id, model, system_prompt, status, end_reason, created_at, updated_at, ended_at
             FROM conversations WHERE id = ?1",
            [id],
            row_to_conversation,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_active(&self) -> anyhow::Result<Vec<Conversation>> {
        self.list_by_status("active", "updated_at")
    }

    pub fn list_archived(&self) -> anyhow::Result<Vec<Conversation>> {
        self.list_by_status("archived", "ended_at")
    }

    fn list_by_status(&self, status: &str, order_col: &str) -> anyhow::Result<Vec<Conversation>> {
        let conn = get_conn(&self.pool)?;
        let sql = format!(
            "SELECT id, model, system_prompt, status, end_reason, created_at, updated_at, ended_at
             FROM conversations WHERE status = ?1 ORDER BY {} DESC",
            order_col
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([status])?;
        let mut conversations = Vec::new();
        while let Some(row) = rows.next()? {
            conversations.push(row_to_conversation(row)?);
        }
        Ok(conversations)
    }

    /// Append a message with the next ordinal and bump `updated_at`, in one
    /// transaction.
    pub fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> anyhow::Result<StoredMessage> {
        let mut conn = get_conn(&self.pool)?;
        let now = Utc::now();
        let tx = conn.transaction()?;

        let next_index: i32 = tx.query_row(
            "SELECT COALESCE(MAX(message_index) + 1, 0) FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO messages (conversation_id, message_index, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![conversation_id, next_index, role.as_str(), content, now.to_rfc3339()],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), conversation_id],
        )?;
        tx.commit()?;

        Ok(StoredMessage {
            id,
            conversation_id: conversation_id.to_string(),
            message_index: next_index,
            role,
            content: content.to_string(),
            created_at: now,
        })
    }

    pub fn messages(&self, conversation_id: &str) -> anyhow::Result<Vec<StoredMessage>> {
        let conn = get_conn(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, message_index, role, content, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY message_index",
        )?;
        let mut rows = stmt.query([conversation_id])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(row_to_message(row)?);
        }
        Ok(messages)
    }

    pub fn message_count(&self, conversation_id: &str) -> anyhow::Result<usize> {
        let conn = get_conn(&self.pool)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn last_message_role(&self, conversation_id: &str) -> anyhow::Result<Option<Role>> {
        let conn = get_conn(&self.pool)?;
        let role: Option<String> = conn
            .query_row(
                "SELECT role FROM messages WHERE conversation_id = ?1
                 ORDER BY message_index DESC LIMIT 1",
                [conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(role.and_then(|r| Role::parse(&r)))
    }

    /// Flip to archived. Returns false when the conversation was already
    /// archived (no row changed); messages are never touched.
    pub fn archive(&self, id: &str, reason: EndReason) -> anyhow::Result<bool> {
        let conn = get_conn(&self.pool)?;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE conversations
             SET status = 'archived', end_reason = ?1, ended_at = ?2, updated_at = ?2
             WHERE id = ?3 AND status = 'active'",
            params![reason.as_str(), now, id],
        )?;
        Ok(changed > 0)
    }

    /// Hard delete; messages cascade. Returns the number of conversations
    /// removed.
    pub fn delete(&self, id: &str) -> anyhow::Result<usize> {
        let conn = get_conn(&self.pool)?;
        let deleted = conn.execute("DELETE FROM conversations WHERE id = ?1", [id])?;
        if deleted > 0 {
            info!("deleted conversation {}", id);
        }
        Ok(deleted)
    }

    pub fn delete_archived(&self) -> anyhow::Result<usize> {
        let conn = get_conn(&self.pool)?;
        let deleted = conn.execute("DELETE FROM conversations WHERE status = 'archived'", [])?;
        info!("purged {} archived conversation(s)", deleted);
        Ok(deleted)
    }

    /// Archive every active conversation idle since before `cutoff` as a
    /// timeout, in one UPDATE. Returns the affected ids.
    pub fn archive_stale(&self, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<String>> {
        let mut conn = get_conn(&self.pool)?;
        let tx = conn.transaction()?;
        let cutoff_str = cutoff.to_rfc3339();

        let stale: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM conversations WHERE status = 'active' AND updated_at < ?1",
            )?;
            let ids = stmt.query_map([&cutoff_str], |row| row.get(0))?;
            ids.collect::<rusqlite::Result<Vec<_>>>()?
        };
        if !stale.is_empty() {
            let now = Utc::now().to_rfc3339();
            tx.execute(
                "UPDATE conversations
                 SET status = 'archived', end_reason = 'timeout', ended_at = ?1
                 WHERE status = 'active' AND updated_at < ?2",
                params![now, cutoff_str],
            )?;
        }
        tx.commit()?;
        Ok(stale)
    }

    /// Test hook for the sweeper: rewrite a conversation's updated_at.
    #[cfg(test)]
    pub fn force_updated_at(&self, id: &str, when: DateTime<Utc>) -> anyhow::Result<()> {
        let conn = get_conn(&self.pool)?;
        conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![when.to_rfc3339(), id],
        )?;
        Ok(())
    }
}

fn parse_datetime(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_conversation(row: &Row) -> rusqlite::Result<Conversation> {
    let status: String = row.get(3)?;
    let end_reason: Option<String> = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    let ended_at: Option<String> = row.get(7)?;
    Ok(Conversation {
        id: row.get(0)?,
        model: row.get(1)?,
        system_prompt: row.get(2)?,
        status: ConversationStatus::parse(&status).unwrap_or(ConversationStatus::Active),
        end_reason: end_reason.as_deref().and_then(EndReason::parse),
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
        ended_at: ended_at.as_deref().map(parse_datetime),
    })
}

fn row_to_message(row: &Row) -> rusqlite::Result<StoredMessage> {
    let role: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        message_index: row.get(2)?,
        role: Role::parse(&role).unwrap_or(Role::User),
        content: row.get(4)?,
        created_at: parse_datetime(&created_at),
    })
}
