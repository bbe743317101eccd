use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::middleware::{Identity, JwtSecret};
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Identity extractor can find it.
async fn inject_jwt_secret(
    State(state): State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// GET /api/relay/online: identities with a live connection, ascending.
async fn online_users(State(state): State<AppState>, identity: Identity) -> Response {
    match state.relay.online_users().await {
        Ok(online) => Json(serde_json::json!({ "online": online })).into_response(),
        Err(e) => {
            tracing::error!(user_id = identity.user_id, "Online lookup failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "relay unavailable").into_response()
        }
    }
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // WebSocket endpoint (token via Authorization header or ?token=)
    let ws_routes = Router::new().route("/ws", get(ws_handler::ws_upgrade));

    let api_routes = Router::new().route("/api/relay/online", get(online_users));

    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(ws_routes)
        .merge(api_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
