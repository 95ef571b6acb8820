//! Error types for web handlers.
//!
//! This module bridges gate and mutation failures to HTTP responses. Every
//! error renders as `{"status": <code>, "message": <text>}`; internal
//! sources are logged and never reach the client.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::fmt;
use steadfast_core::idempotency::{IdentityError, MutationError};
use steadfast_runtime::GateError;

/// Application error type for web handlers.
///
/// Implements Axum's `IntoResponse`, so handlers can return
/// `Result<_, AppError>` and use `?` on gate and mutation errors.
///
/// # Examples
///
/// ```ignore
/// async fn handler() -> Result<Json<Task>, AppError> {
///     let task = find_task(id).await
///         .ok_or_else(|| AppError::not_found("Task", id))?;
///     Ok(Json(task))
/// }
/// ```
#[derive(Debug)]
pub struct AppError {
    /// HTTP status code
    status: StatusCode,
    /// Error message (user-facing)
    message: String,
    /// Internal error (for logging, not exposed to client)
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Create a new application error.
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            source: None,
        }
    }

    /// Attach an internal source error, logged but not returned.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// HTTP status of this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// User-facing message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Create a 400 Bad Request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Create a 404 Not Found error.
    #[must_use]
    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            format!("{resource} with id {id} not found"),
        )
    }

    /// Create a 409 Conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    /// Create a 408 Request Timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::REQUEST_TIMEOUT, message)
    }

    /// Create a 429 Too Many Requests error.
    #[must_use]
    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, message)
    }

    /// Create a 500 Internal Server Error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Create a 503 Service Unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.status.as_u16(), self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Error response body (JSON).
#[derive(Debug, Serialize)]
pub(crate) struct ErrorBody<'a> {
    /// HTTP status code, repeated in the body.
    pub(crate) status: u16,
    /// Human-readable error message.
    pub(crate) message: &'a str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            match &self.source {
                Some(source) => tracing::error!(
                    status = %self.status,
                    message = %self.message,
                    error = %source,
                    "Internal server error"
                ),
                None => tracing::error!(
                    status = %self.status,
                    message = %self.message,
                    "Internal server error"
                ),
            }
        }

        let body = ErrorBody {
            status: self.status.as_u16(),
            message: &self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

/// Convert `anyhow::Error` to `AppError`.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal("An internal error occurred").with_source(err)
    }
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<MutationError> for AppError {
    fn from(err: MutationError) -> Self {
        let status =
            StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        match err {
            // Internal details stay in the log.
            MutationError::Internal(detail) => {
                Self::internal("An internal error occurred").with_source(anyhow::anyhow!(detail))
            }
            other => Self::new(status, other.to_string()),
        }
    }
}

impl From<GateError> for AppError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::Conflict => Self::conflict(err.to_string()),
            GateError::Unavailable => Self::unavailable(err.to_string()),
            GateError::Mutation(failure) => failure.into(),
            GateError::Aborted => Self::internal(err.to_string()),
        }
    }
}
