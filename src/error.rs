//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **Relay errors** (`AudioError`, `SessionError`, `CallError`): the failure
//!   taxonomy of the audio core. Every one of them is local to a single call and
//!   fatal to that call. Nothing in the relay retries.
//! - **HTTP errors** (`AppError`): what the REST/WebSocket surface returns to
//!   clients, rendered as JSON by the `ResponseError` impl.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "validation_error",
//!     "message": "Server port cannot be 0",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use crate::relay::registry::AdmitError;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Failures of the pure codec/resampler functions.
///
/// These always mean the stream is corrupted (wrong encoding, misaligned
/// sample buffer, impossible rate). They are never transient.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    /// Companded input could not be expanded to linear PCM
    #[error("Decoding failed: {reason}")]
    Decode { reason: String },

    /// Linear PCM input could not be compressed to companded samples
    #[error("Encoding failed: {reason}")]
    Encode { reason: String },

    /// Rate conversion was asked to work on an invalid buffer or rate
    #[error("Resampling failed: {reason}")]
    Resample { reason: String },
}

impl AudioError {
    pub fn decode(reason: impl Into<String>) -> Self {
        Self::Decode { reason: reason.into() }
    }

    pub fn encode(reason: impl Into<String>) -> Self {
        Self::Encode { reason: reason.into() }
    }

    pub fn resample(reason: impl Into<String>) -> Self {
        Self::Resample { reason: reason.into() }
    }
}

/// Failures reported by the AI voice endpoint collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Endpoint unreachable or session rejected; the call never streams
    #[error("Session initialization failed: {0}")]
    Init(String),

    /// Mid-stream failure; the call moves to teardown
    #[error("Session stream failed: {0}")]
    Stream(String),

    /// Teardown failure; logged by the orchestrator and never escalated
    #[error("Session close failed: {0}")]
    Close(String),
}

/// Anything that ends a call early.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Custom error types for the HTTP surface.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested call or resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Capacity**: Concurrent call limit reached (503 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    Capacity(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Capacity(msg) => write!(f, "Capacity exceeded: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    fn parts(&self) -> (actix_web::http::StatusCode, &'static str, &str) {
        use actix_web::http::StatusCode;

        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg),
            AppError::Capacity(msg) => (StatusCode::SERVICE_UNAVAILABLE, "capacity_exceeded", msg),
        }
    }
}

/// Converts errors into JSON HTTP responses.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500
/// - BadRequest/ValidationError → 400
/// - NotFound → 404
/// - Capacity → 503
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<AdmitError> for AppError {
    fn from(err: AdmitError) -> Self {
        match err {
            AdmitError::AtCapacity { .. } => AppError::Capacity(err.to_string()),
            AdmitError::Duplicate(_) => AppError::BadRequest(err.to_string()),
        }
    }
}

/// Shorthand for `Result<T, AppError>` in HTTP handlers.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[test]
    fn test_call_error_wraps_taxonomy() {
        let err: CallError = AudioError::resample("odd byte length").into();
        assert_eq!(err.to_string(), "Resampling failed: odd byte length");

        let err: CallError = SessionError::Stream("socket reset".to_string()).into();
        assert!(matches!(err, CallError::Session(SessionError::Stream(_))));
    }

    #[actix_web::test]
    async fn test_capacity_error_response() {
        let err = AppError::Capacity("100 calls active".to_string());
        assert_eq!(err.status_code(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);

        let body = to_bytes(err.error_response().into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "capacity_exceeded");
        assert_eq!(value["error"]["message"], "100 calls active");
    }
}
