//! The relay's single serialization point.
//!
//! Consumes [`RelayEvent`]s one at a time and is the only code that reads or
//! mutates the [`ConnectionRegistry`]. Delivery is one bounded write per
//! dispatch; persistence is handed to a detached task so a slow or failing
//! store never holds up the loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use super::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, Envelope, MessageStore, RelayEvent,
    UserId, CLOSE_DELIVERY_FAILED, CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_SUPERSEDED,
};

pub struct Coordinator {
    registry: ConnectionRegistry,
    store: Arc<dyn MessageStore>,
    write_timeout: Duration,
    events: mpsc::UnboundedReceiver<RelayEvent>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn MessageStore>,
        write_timeout: Duration,
        events: mpsc::UnboundedReceiver<RelayEvent>,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            store,
            write_timeout,
            events,
        }
    }

    /// Run until a shutdown event arrives or every sender of the mailbox is
    /// dropped, then close whatever connections are still registered.
    pub async fn run(mut self) {
        tracing::info!(
            write_timeout_ms = self.write_timeout.as_millis() as u64,
            "Relay coordinator started"
        );

        while let Some(event) = self.events.recv().await {
            if let RelayEvent::Shutdown = event {
                break;
            }
            self.handle_event(event).await;
        }

        let remaining = self.registry.drain();
        tracing::info!(
            connections = remaining.len(),
            "Relay coordinator stopping"
        );
        for handle in remaining {
            handle.close(CLOSE_GOING_AWAY, "server shutting down");
        }
    }

    async fn handle_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Register(handle) => self.register(handle),
            RelayEvent::Unregister { user_id, conn_id } => self.unregister(user_id, conn_id),
            RelayEvent::Dispatch(envelope) => self.dispatch(envelope).await,
            RelayEvent::OnlineUsers(reply) => {
                let _ = reply.send(self.registry.user_ids());
            }
            RelayEvent::Shutdown => {}
        }
    }

    fn register(&mut self, handle: ConnectionHandle) {
        let user_id = handle.user_id();
        let conn_id = handle.conn_id();

        if let Some(previous) = self.registry.insert(handle) {
            tracing::info!(
                user_id = user_id,
                old_conn_id = previous.conn_id(),
                new_conn_id = conn_id,
                "Connection superseded, closing previous"
            );
            previous.close(CLOSE_SUPERSEDED, "superseded by a newer connection");
        }

        tracing::debug!(
            user_id = user_id,
            conn_id = conn_id,
            online = self.registry.len(),
            "Connection registered"
        );
    }

    fn unregister(&mut self, user_id: UserId, conn_id: ConnectionId) {
        match self.registry.remove_if(user_id, conn_id) {
            Some(handle) => {
                handle.close(CLOSE_NORMAL, "");
                tracing::debug!(
                    user_id = user_id,
                    conn_id = conn_id,
                    online = self.registry.len(),
                    "Connection unregistered"
                );
            }
            None => {
                tracing::debug!(
                    user_id = user_id,
                    conn_id = conn_id,
                    "Unregister for absent or superseded connection"
                );
            }
        }
    }

    async fn dispatch(&mut self, envelope: Envelope) {
        self.persist(envelope.clone());

        let receiver_id = envelope.receiver_id;
        let Some(handle) = self.registry.get(receiver_id) else {
            tracing::debug!(
                sender_id = envelope.sender_id,
                receiver_id = receiver_id,
                "Receiver offline, delivery dropped"
            );
            return;
        };

        let frame = match serde_json::to_string(&envelope) {
            Ok(json) => Message::Text(json.into()),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode envelope");
                return;
            }
        };

        let outcome = handle.send(frame, self.write_timeout).await;
        if let Err(e) = outcome {
            tracing::warn!(
                sender_id = envelope.sender_id,
                receiver_id = receiver_id,
                error = %e,
                "Delivery failed, dropping receiver connection"
            );
            if let Some(dead) = self.registry.remove(receiver_id) {
                dead.close(CLOSE_DELIVERY_FAILED, "delivery failed");
            }
        }
    }

    /// Fire-and-forget write of the message record.
    fn persist(&self, envelope: Envelope) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            match store
                .create_message(envelope.sender_id, envelope.receiver_id, &envelope.content)
                .await
            {
                Ok(record) => {
                    tracing::debug!(message_id = record.id, "Message persisted");
                }
                Err(e) => {
                    tracing::warn!(
                        sender_id = envelope.sender_id,
                        receiver_id = envelope.receiver_id,
                        error = %e,
                        "Failed to persist message"
                    );
                }
            }
        });
    }
}
