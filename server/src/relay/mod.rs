//! Realtime message relay.
//!
//! One coordinator task owns the connection registry and applies register,
//! unregister and dispatch events strictly one at a time. WebSocket sessions
//! and HTTP handlers never touch the registry; they hold a cloned [`Relay`]
//! and send it typed events.

pub mod coordinator;
pub mod error;
pub mod registry;
pub mod store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::RelayConfig;

pub use coordinator::Coordinator;
pub use error::RelayError;
pub use registry::ConnectionRegistry;
pub use store::{MessageStore, StoreError};

/// Stable numeric identity resolved by the identity provider.
pub type UserId = u64;

/// Relay-assigned id distinguishing successive connections of one user.
pub type ConnectionId = u64;

/// Close code sent when a connection is unregistered.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code sent to every live connection when the coordinator stops.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code sent when an outbound write to the connection failed.
pub const CLOSE_DELIVERY_FAILED: u16 = 1011;
/// Close code sent to a connection replaced by a newer one for the same user.
pub const CLOSE_SUPERSEDED: u16 = 4000;

/// Wire envelope: `{"sender_id": .., "receiver_id": .., "content": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
}

/// Inbound frame shape. Any `sender_id` the client sends is ignored.
#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    receiver_id: UserId,
    content: String,
}

impl Envelope {
    /// Decode a client text frame and stamp it with the authenticated sender.
    pub fn decode_inbound(text: &str, sender_id: UserId) -> Result<Self, RelayError> {
        let inbound: InboundEnvelope = serde_json::from_str(text)?;
        Ok(Self {
            sender_id,
            receiver_id: inbound.receiver_id,
            content: inbound.content,
        })
    }
}

/// Write side of one admitted connection.
///
/// Frames pushed here are drained by the connection's writer task. Once the
/// handle is registered only the coordinator holds it; dropping it closes
/// the queue and lets the writer task finish.
#[derive(Debug)]
pub struct ConnectionHandle {
    user_id: UserId,
    conn_id: ConnectionId,
    outbound: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    pub fn new(user_id: UserId, conn_id: ConnectionId, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            user_id,
            conn_id,
            outbound,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    /// Queue a frame, failing if the writer is gone or has not made room
    /// within `write_timeout`.
    pub async fn send(&self, message: Message, write_timeout: Duration) -> Result<(), RelayError> {
        self.outbound
            .send_timeout(message, write_timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => RelayError::DeliveryTimeout(write_timeout),
                SendTimeoutError::Closed(_) => RelayError::ReceiverGone,
            })
    }

    /// Queue a close frame (best effort) and drop the handle.
    pub fn close(self, code: u16, reason: &'static str) {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        if self.outbound.try_send(Message::Close(Some(frame))).is_err() {
            tracing::debug!(
                user_id = self.user_id,
                conn_id = self.conn_id,
                "Close frame not queued, writer gone or backed up"
            );
        }
    }
}

/// Events consumed by the coordinator, in arrival order.
#[derive(Debug)]
pub enum RelayEvent {
    Register(ConnectionHandle),
    Unregister {
        user_id: UserId,
        conn_id: ConnectionId,
    },
    Dispatch(Envelope),
    /// Read-only snapshot of the currently registered identities.
    OnlineUsers(oneshot::Sender<Vec<UserId>>),
    /// Stop consuming events and close every registered connection.
    Shutdown,
}

/// Cloneable entry point to the coordinator's mailbox.
#[derive(Clone, Debug)]
pub struct Relay {
    events: mpsc::UnboundedSender<RelayEvent>,
    next_conn_id: Arc<AtomicU64>,
}

impl Relay {
    /// Start a coordinator task and return the handle that feeds it.
    ///
    /// The coordinator stops on [`Relay::shutdown`] or once every `Relay`
    /// clone has been dropped.
    pub fn spawn(store: Arc<dyn MessageStore>, config: RelayConfig) -> (Self, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(store, config.write_timeout(), events_rx);
        let task = tokio::spawn(coordinator.run());

        let relay = Self {
            events: events_tx,
            next_conn_id: Arc::new(AtomicU64::new(1)),
        };
        (relay, task)
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, handle: ConnectionHandle) -> Result<(), RelayError> {
        self.send(RelayEvent::Register(handle))
    }

    pub fn unregister(&self, user_id: UserId, conn_id: ConnectionId) -> Result<(), RelayError> {
        self.send(RelayEvent::Unregister { user_id, conn_id })
    }

    pub fn dispatch(&self, envelope: Envelope) -> Result<(), RelayError> {
        self.send(RelayEvent::Dispatch(envelope))
    }

    /// Identities registered at the moment the coordinator reaches this request.
    pub async fn online_users(&self) -> Result<Vec<UserId>, RelayError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RelayEvent::OnlineUsers(reply_tx))?;
        reply_rx.await.map_err(|_| RelayError::CoordinatorGone)
    }

    /// Ask the coordinator to close all connections (1001) and exit.
    /// Events queued ahead of this one are still applied.
    pub fn shutdown(&self) -> Result<(), RelayError> {
        self.send(RelayEvent::Shutdown)
    }

    fn send(&self, event: RelayEvent) -> Result<(), RelayError> {
        self.events
            .send(event)
            .map_err(|_| RelayError::CoordinatorGone)
    }
}
