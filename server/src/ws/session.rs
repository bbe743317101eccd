use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::RelayConfig;
use crate::relay::{ConnectionHandle, Envelope, Relay, UserId};

/// Drive one authenticated connection until either side ends it.
///
/// Splits the connection into reader and writer halves:
/// - Writer task: owns the sink, drains the bounded queue behind this
///   connection's [`ConnectionHandle`]
/// - Reader loop: decodes text frames into envelopes and hands them to the relay
///
/// The session registers itself on start and sends exactly one unregister
/// (tagged with its connection id) when the reader loop ends.
pub async fn run_session<S, W>(
    mut stream: S,
    sink: W,
    relay: Relay,
    user_id: UserId,
    config: RelayConfig,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin + Send,
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
{
    let conn_id = relay.next_connection_id();
    let (tx, rx) = mpsc::channel::<Message>(config.outbound_buffer.max(1));

    let mut writer = tokio::spawn(writer_task(sink, rx, config.write_timeout()));

    if let Err(e) = relay.register(ConnectionHandle::new(user_id, conn_id, tx)) {
        tracing::error!(user_id, conn_id, "Register failed: {}", e);
        return;
    }

    tracing::info!(user_id, conn_id, "Session started");

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match Envelope::decode_inbound(text.as_str(), user_id) {
                        Ok(envelope) => {
                            if let Err(e) = relay.dispatch(envelope) {
                                tracing::error!(user_id, conn_id, "Dispatch failed: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(user_id, conn_id, "Dropping malformed frame: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    tracing::debug!(user_id, conn_id, len = data.len(), "Ignoring binary frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(user_id, conn_id, reason = ?frame, "Client initiated close");
                    break;
                }
                // Ping/Pong are answered by the protocol layer
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(user_id, conn_id, error = %e, "WebSocket receive error");
                    break;
                }
                None => {
                    tracing::info!(user_id, conn_id, "WebSocket stream ended");
                    break;
                }
            },
            _ = &mut writer => {
                tracing::info!(user_id, conn_id, "Connection closed by relay");
                break;
            }
        }
    }

    if let Err(e) = relay.unregister(user_id, conn_id) {
        tracing::debug!(user_id, conn_id, "Unregister after shutdown: {}", e);
    }

    tracing::info!(user_id, conn_id, "Session stopped");
}

/// Writer task: forwards queued frames to the sink. Stops after a close
/// frame, on the first failed or stalled write, or once the handle is dropped.
async fn writer_task<W>(mut sink: W, mut rx: mpsc::Receiver<Message>, write_timeout: Duration)
where
    W: Sink<Message> + Unpin,
    W::Error: Display + Send,
{
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));

        match timeout(write_timeout, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!("WebSocket send failed: {}", e);
                break;
            }
            Err(_) => {
                tracing::warn!(?write_timeout, "WebSocket send stalled");
                break;
            }
        }

        if closing {
            break;
        }
    }

    let _ = timeout(write_timeout, sink.close()).await;
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};

    use futures_channel::mpsc as fmpsc;

    use super::*;
    use crate::relay::store::RecordingStore;
    use crate::relay::CLOSE_SUPERSEDED;

    const WAIT: Duration = Duration::from_secs(2);

    fn config() -> RelayConfig {
        RelayConfig {
            write_timeout_ms: 200,
            outbound_buffer: 8,
        }
    }

    type Inbound = fmpsc::UnboundedSender<Result<Message, axum::Error>>;
    type Outbound = fmpsc::UnboundedReceiver<Message>;

    fn start_session(relay: &Relay, user_id: UserId) -> (Inbound, Outbound, tokio::task::JoinHandle<()>) {
        let (in_tx, in_rx) = fmpsc::unbounded();
        let (out_tx, out_rx) = fmpsc::unbounded();
        let task = tokio::spawn(run_session(in_rx, out_tx, relay.clone(), user_id, config()));
        (in_tx, out_rx, task)
    }

    async fn wait_online(relay: &Relay, user_id: UserId) {
        timeout(WAIT, async {
            while !relay.online_users().await.unwrap().contains(&user_id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("user came online");
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_end_session() {
        let (store, mut calls) = RecordingStore::with_notifier();
        let (relay, _coordinator) = Relay::spawn(Arc::new(store), config());

        let (peer_tx, mut peer_rx) = tokio::sync::mpsc::channel(8);
        relay
            .register(ConnectionHandle::new(2, relay.next_connection_id(), peer_tx))
            .unwrap();

        let (in_tx, _out_rx, session) = start_session(&relay, 1);
        in_tx
            .unbounded_send(Ok(Message::Text("{not json".into())))
            .unwrap();
        in_tx
            .unbounded_send(Ok(Message::Text(
                r#"{"sender_id":99,"receiver_id":2,"content":"hi"}"#.into(),
            )))
            .unwrap();

        let delivered = timeout(WAIT, peer_rx.recv()).await.unwrap().unwrap();
        let Message::Text(text) = delivered else {
            panic!("expected text frame, got {:?}", delivered);
        };
        let envelope: Envelope = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(envelope.sender_id, 1);
        assert_eq!(envelope.receiver_id, 2);
        assert_eq!(envelope.content, "hi");

        let persisted = timeout(WAIT, calls.recv()).await.unwrap().unwrap();
        assert_eq!(persisted, (1, 2, "hi".to_string()));

        assert!(!session.is_finished());
        assert!(peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stream_end_unregisters() {
        let (relay, _coordinator) = Relay::spawn(Arc::new(RecordingStore::default()), config());

        let (in_tx, _out_rx, session) = start_session(&relay, 3);
        wait_online(&relay, 3).await;

        in_tx
            .unbounded_send(Ok(Message::Binary(vec![1, 2, 3].into())))
            .unwrap();
        drop(in_tx);

        timeout(WAIT, session).await.unwrap().unwrap();
        assert!(!relay.online_users().await.unwrap().contains(&3));
    }

    #[tokio::test]
    async fn test_superseded_session_receives_close() {
        let (relay, _coordinator) = Relay::spawn(Arc::new(RecordingStore::default()), config());

        let (_in_tx, mut out_rx, session) = start_session(&relay, 4);
        wait_online(&relay, 4).await;

        let (next_tx, _next_rx) = tokio::sync::mpsc::channel(8);
        relay
            .register(ConnectionHandle::new(4, relay.next_connection_id(), next_tx))
            .unwrap();

        let frame = timeout(WAIT, out_rx.next()).await.unwrap();
        match frame {
            Some(Message::Close(Some(close))) => assert_eq!(close.code, CLOSE_SUPERSEDED),
            other => panic!("expected close frame, got {:?}", other),
        }

        timeout(WAIT, session).await.unwrap().unwrap();
        // The stale unregister must leave the successor in place
        assert!(relay.online_users().await.unwrap().contains(&4));
    }

    /// Socket whose writes never make progress.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = std::convert::Infallible;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_stalled_socket_write_ends_session() {
        let (relay, _coordinator) = Relay::spawn(Arc::new(RecordingStore::default()), config());

        let (_in_tx, in_rx) = fmpsc::unbounded::<Result<Message, axum::Error>>();
        let session = tokio::spawn(run_session(in_rx, StalledSink, relay.clone(), 7, config()));
        wait_online(&relay, 7).await;

        relay
            .dispatch(Envelope {
                sender_id: 1,
                receiver_id: 7,
                content: "stuck".to_string(),
            })
            .unwrap();

        // One bounded write plus one bounded close, well inside WAIT
        timeout(WAIT, session)
            .await
            .expect("session must end once the socket write times out")
            .unwrap();
        assert!(relay.online_users().await.unwrap().is_empty());
    }
}
