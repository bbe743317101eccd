//! Message store contract consumed by the coordinator's persistence path.

use async_trait::async_trait;

use super::UserId;
use crate::db::models::MessageRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable, append-only chat history.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append one message. The store assigns the id and creation time.
    async fn create_message(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
    ) -> Result<MessageRecord, StoreError>;
}

#[cfg(test)]
pub(crate) use testing::RecordingStore;

#[cfg(test)]
mod testing {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    /// In-memory store that reports every call and can be told to fail slowly.
    #[derive(Default)]
    pub(crate) struct RecordingStore {
        calls: Mutex<Vec<(UserId, UserId, String)>>,
        notify: Mutex<Option<mpsc::UnboundedSender<(UserId, UserId, String)>>>,
        failure_delay: Option<Duration>,
    }

    impl RecordingStore {
        /// Returns the store plus a receiver that yields each create call.
        pub(crate) fn with_notifier() -> (Self, mpsc::UnboundedReceiver<(UserId, UserId, String)>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let store = Self {
                notify: Mutex::new(Some(tx)),
                ..Self::default()
            };
            (store, rx)
        }

        /// Every create call sleeps for `delay` and then fails.
        pub(crate) fn failing_after(mut self, delay: Duration) -> Self {
            self.failure_delay = Some(delay);
            self
        }

        pub(crate) fn calls(&self) -> Vec<(UserId, UserId, String)> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl MessageStore for RecordingStore {
        async fn create_message(
            &self,
            sender_id: UserId,
            receiver_id: UserId,
            content: &str,
        ) -> Result<MessageRecord, StoreError> {
            let call = (sender_id, receiver_id, content.to_string());
            let id = {
                let mut calls = self.calls.lock().map_err(|_| StoreError::LockPoisoned)?;
                calls.push(call.clone());
                calls.len() as i64
            };
            if let Ok(notify) = self.notify.lock() {
                if let Some(tx) = notify.as_ref() {
                    let _ = tx.send(call);
                }
            }

            if let Some(delay) = self.failure_delay {
                tokio::time::sleep(delay).await;
                return Err(StoreError::Unavailable("forced failure".to_string()));
            }

            Ok(MessageRecord {
                id,
                sender_id,
                receiver_id,
                content: content.to_string(),
                created_at: chrono::Utc::now().to_rfc3339(),
            })
        }
    }
}
