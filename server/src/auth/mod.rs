//! Identity provider: resolves a bearer credential to a numeric user id
//! before a connection is admitted to the relay.

pub mod jwt;
pub mod middleware;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing or malformed bearer credential")]
    MissingCredential,

    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("signing key not configured")]
    MissingSecret,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::MissingCredential | AuthError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            AuthError::MissingSecret => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::debug!(error = %self, "Request rejected");
        (status, self.to_string()).into_response()
    }
}
