//! SQLite-backed chat history.

use async_trait::async_trait;
use chrono::Utc;

use crate::db::models::MessageRecord;
use crate::db::DbPool;
use crate::relay::{MessageStore, StoreError, UserId};

/// Upper bound on rows returned by [`SqliteMessageStore::conversation`].
const MAX_HISTORY: u32 = 200;

#[derive(Clone)]
pub struct SqliteMessageStore {
    db: DbPool,
}

impl SqliteMessageStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Most recent messages exchanged between two users, oldest first.
    pub async fn conversation(
        &self,
        user_a: UserId,
        user_b: UserId,
        limit: u32,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let db = self.db.clone();
        let limit = limit.min(MAX_HISTORY);

        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, receiver_id, content, created_at
                 FROM messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)
                 ORDER BY id DESC
                 LIMIT ?3",
            )?;

            let mut records = stmt
                .query_map(
                    rusqlite::params![user_a as i64, user_b as i64, limit],
                    |row| {
                        Ok(MessageRecord {
                            id: row.get(0)?,
                            sender_id: row.get::<_, i64>(1)? as u64,
                            receiver_id: row.get::<_, i64>(2)? as u64,
                            content: row.get(3)?,
                            created_at: row.get(4)?,
                        })
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;

            records.reverse();
            Ok::<_, StoreError>(records)
        })
        .await?
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn create_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> Result<MessageRecord, StoreError> {
        let db = self.db.clone();
        let content = content.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            let created_at = Utc::now().to_rfc3339();

            conn.execute(
                "INSERT INTO messages (sender_id, receiver_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![sender_id as i64, receiver_id as i64, content, created_at],
            )?;

            Ok::<_, StoreError>(MessageRecord {
                id: conn.last_insert_rowid(),
                sender_id,
                receiver_id,
                content,
                created_at,
            })
        })
        .await?
    }
}
