use crate::{
    auth::jwt::{AuthRejection, JwtCredentialVerifier},
    error::{ErrorCode, RelayError},
};
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use easel_common::types::Identity;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub identity: Identity,
}

pub async fn require_bearer_auth(
    State(verifier): State<Arc<JwtCredentialVerifier>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match request_token(request.headers(), request.uri()) {
        Some(token) => token,
        None => return unauthorized_response(ErrorCode::AuthInvalidToken, "missing bearer token"),
    };

    let identity = match verifier.authenticate(&token) {
        Ok(identity) => identity,
        Err(AuthRejection::Expired) => {
            return unauthorized_response(ErrorCode::AuthTokenExpired, "bearer token has expired")
        }
        Err(_) => return unauthorized_response(ErrorCode::AuthInvalidToken, "invalid bearer token"),
    };

    request.extensions_mut().insert(AuthenticatedUser { identity });

    next.run(request).await
}

/// Credential carried by a request: the `Authorization: Bearer` header, or
/// the `token` query parameter for browser WebSocket clients.
pub fn request_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .map(ToOwned::to_owned)
        .or_else(|| uri.query().and_then(token_from_query))
}

pub fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

// JWTs are base64url with dots, so no percent-decoding is needed.
fn token_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: ErrorCode, message: &'static str) -> Response {
    RelayError::new(code, message).into_response()
}
