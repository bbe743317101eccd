use serde::Serialize;

/// Persisted chat message (row in `messages`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageRecord {
    pub id: i64,
    pub sender_id: u64,
    pub receiver_id: u64,
    pub content: String,
    /// RFC 3339, assigned when the row is written
    pub created_at: String,
}
