use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
};
use futures_util::StreamExt;

use crate::auth::middleware::Identity;
use crate::state::AppState;
use crate::ws::session;

/// GET /ws
/// WebSocket upgrade endpoint. The Identity extractor runs first, so a
/// missing or invalid token is answered with 401 and no socket is opened.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    identity: Identity,
    ws: WebSocketUpgrade,
) -> Response {
    tracing::info!(user_id = identity.user_id, "WebSocket connection authenticated");

    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        session::run_session(
            stream,
            sink,
            state.relay,
            identity.user_id,
            state.relay_config,
        )
        .await;
    })
}
