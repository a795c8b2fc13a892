//! Per-exchange error type.
//!
//! Any gas, pregas or routed handler returns `Result<(), Error>`. Errors are
//! recovered at the dispatch boundary and handed to the engine's error
//! handler exactly once; they never reach the listener.

use axum::http::StatusCode;
use thiserror::Error;

/// Errors produced while handling a single exchange.
#[derive(Debug, Error)]
pub enum Error {
    /// An error that carries the HTTP status it should be reported with.
    #[error("{message}")]
    Status { status: StatusCode, message: String },

    /// Reading the request body failed.
    #[error("failed to read request body: {0}")]
    Body(#[from] axum::Error),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything else a handler wants to bubble up.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Build an error tagged with `status`.
    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        Error::Status {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::status(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized() -> Self {
        Self::status(StatusCode::UNAUTHORIZED, "Unauthorized")
    }

    pub fn not_found() -> Self {
        Self::status(StatusCode::NOT_FOUND, "Not Found")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::status(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// The status this error maps to when nothing has been committed yet.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Status { status, .. } => *status,
            Error::Body(_) => StatusCode::BAD_REQUEST,
            Error::Json(_) | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type for handlers.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_keep_their_code() {
        assert_eq!(Error::bad_request("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::unauthorized().status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::not_found().status_code(), StatusCode::NOT_FOUND);
        assert_eq!(Error::not_found().to_string(), "Not Found");
    }

    #[test]
    fn boxed_errors_are_internal() {
        let err: Error = Box::<dyn std::error::Error + Send + Sync>::from("boom").into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "boom");
    }
}
