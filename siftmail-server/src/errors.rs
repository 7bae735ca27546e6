//! Maps engine/config errors onto HTTP responses (spec §7 error taxonomy).

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use siftmail_core::error::EngineError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));
        (self.status, body).into_response()
    }
}

/// `Protocol` → 400 (malformed request), `Auth` → 403 (spec §7, reachable
/// here only via the fuzzy allow-list gate rather than a shared secret —
/// see DESIGN.md), `Transient`/`Fatal` → 503 (caller may retry), `Configuration`
/// → 500 (should have been caught at startup), `Programmer` is never
/// converted: it panics at the call site instead (spec §7).
impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Protocol(msg) => AppError::bad_request(msg),
            EngineError::Auth(msg) => AppError::forbidden(msg),
            EngineError::Transient(msg) => AppError::service_unavailable(msg),
            EngineError::Fatal(msg) => AppError::service_unavailable(msg),
            EngineError::Configuration(msg) => AppError::internal(msg),
            EngineError::Programmer(msg) => panic!("programmer error: {msg}"),
            EngineError::RuleName(e) => AppError::bad_request(e.to_string()),
            EngineError::Io(e) => AppError::internal(e.to_string()),
            EngineError::Serialization(e) => AppError::bad_request(e.to_string()),
        }
    }
}
