use axum::{
    extract::{FromRequestParts, Query},
    http::{header, request::Parts},
};
use serde::Deserialize;

use crate::auth::{jwt, AuthError};
use crate::relay::UserId;

/// Authenticated caller, resolved from `Authorization: Bearer <jwt>` or,
/// for WebSocket clients that cannot set headers, a `?token=<jwt>` query.
/// Implements axum's FromRequestParts so handlers reject unauthenticated
/// requests before running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
}

/// JWT secret stored in request extensions for the Identity extractor
#[derive(Clone)]
pub struct JwtSecret(pub Vec<u8>);

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let from_header = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    from_header.or_else(|| {
        Query::<TokenQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(q)| q.token)
    })
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(AuthError::MissingCredential)?;

        let jwt_secret = parts
            .extensions
            .get::<JwtSecret>()
            .ok_or(AuthError::MissingSecret)?;

        let user_id = jwt::authenticate(&jwt_secret.0, &token)?;
        Ok(Identity { user_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use std::time::Duration;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    async fn extract(request: Request<()>) -> Result<Identity, AuthError> {
        let (mut parts, _) = request.into_parts();
        parts.extensions.insert(JwtSecret(SECRET.to_vec()));
        Identity::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_bearer_header() {
        let token = jwt::issue_access_token(SECRET, 11, Duration::from_secs(60)).unwrap();
        let request = Request::builder()
            .uri("/ws")
            .header("Authorization", format!("Bearer {}", token))
            .body(())
            .unwrap();

        assert_eq!(extract(request).await.unwrap().user_id, 11);
    }

    #[tokio::test]
    async fn test_query_token() {
        let token = jwt::issue_access_token(SECRET, 12, Duration::from_secs(60)).unwrap();
        let request = Request::builder()
            .uri(format!("/ws?token={}", token))
            .body(())
            .unwrap();

        assert_eq!(extract(request).await.unwrap().user_id, 12);
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let request = Request::builder().uri("/ws").body(()).unwrap();
        assert!(matches!(
            extract(request).await,
            Err(AuthError::MissingCredential)
        ));
    }

    #[tokio::test]
    async fn test_non_bearer_scheme_rejected() {
        let request = Request::builder()
            .uri("/ws")
            .header("Authorization", "Basic dXNlcjpwYXNz")
            .body(())
            .unwrap();
        assert!(matches!(
            extract(request).await,
            Err(AuthError::MissingCredential)
        ));
    }

    #[tokio::test]
    async fn test_garbage_token() {
        let request = Request::builder()
            .uri("/ws?token=not-a-jwt")
            .body(())
            .unwrap();
        assert!(matches!(
            extract(request).await,
            Err(AuthError::InvalidToken(_))
        ));
    }
}
