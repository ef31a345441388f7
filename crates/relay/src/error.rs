// Error codes shared by HTTP error bodies and WebSocket `error` frames, plus
// the task-local request id that HTTP errors echo back.

use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use easel_common::protocol::ws::ServerMessage;
use serde_json::json;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A query parameter failed validation.
    ValidationFailed,
    AuthInvalidToken,
    AuthTokenExpired,
    NotFound,
    /// A WebSocket frame could not be decoded or was rejected.
    InvalidMessage,
    SessionSuperseded,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::AuthTokenExpired => "AUTH_TOKEN_EXPIRED",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::SessionSuperseded => "SESSION_SUPERSEDED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed | Self::InvalidMessage => StatusCode::BAD_REQUEST,
            Self::AuthInvalidToken | Self::AuthTokenExpired => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::SessionSuperseded => StatusCode::CONFLICT,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Only server-side faults are worth retrying unchanged.
    pub const fn retryable(self) -> bool {
        matches!(self, Self::InternalError)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::AuthInvalidToken => "invalid authentication token",
            Self::AuthTokenExpired => "authentication token has expired",
            Self::NotFound => "no such route",
            Self::InvalidMessage => "message could not be decoded",
            Self::SessionSuperseded => "session replaced by a newer connection",
            Self::InternalError => "internal server error",
        }
    }

    /// The WebSocket rendition of this error.
    pub fn frame(self, message: impl Into<String>, room: Option<&str>) -> ServerMessage {
        ServerMessage::Error {
            code: self.as_str().to_string(),
            message: message.into(),
            retryable: self.retryable(),
            room: room.map(str::to_string),
        }
    }
}

/// HTTP error body: `{"error": {code, message, retryable, request_id}}`.
#[derive(Debug, Clone)]
pub struct RelayError {
    code: ErrorCode,
    message: String,
}

impl RelayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let request_id = current_request_id();
        let body = json!({
            "error": {
                "code": self.code.as_str(),
                "message": self.message,
                "retryable": self.code.retryable(),
                "request_id": request_id,
            }
        });

        let mut response = (self.code.status(), Json(body)).into_response();
        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }
        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
