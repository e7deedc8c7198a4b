//! Centralized error types for the Duocast core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses
//!
//! Errors that reach a WebSocket client travel as targeted `error`
//! envelopes; errors that reach an HTTP caller use the JSON body below.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type for the Duocast coordinator.
#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum DuocastError {
    /// A known message type failed to parse or violated its schema.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Submitted source URL host is not on the acceptance list.
    #[error("Only YouTube links are supported ({0})")]
    UrlRejected(String),

    /// External fetcher could not produce a direct stream URL.
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    /// Transcoder exited non-zero before the progressive-ready barrier.
    #[error("Transcode failed: {0}")]
    TranscodeFailed(String),

    /// `load_track` named an id the library does not contain.
    #[error("Track not found: {0}")]
    TrackNotFound(String),

    /// An ingestion is already in flight for this session.
    #[error("An ingestion is already in progress for session {0}")]
    Busy(String),

    /// Session id does not exist (expired or never created).
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Persisted state could not be read or written.
    ///
    /// Surfaced only in logs; the in-memory state stays authoritative
    /// for the current process lifetime.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DuocastError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidMessage(_) => "invalid_message",
            Self::UrlRejected(_) => "url_rejected",
            Self::FetchFailed(_) => "fetch_failed",
            Self::TranscodeFailed(_) => "transcode_failed",
            Self::TrackNotFound(_) => "track_not_found",
            Self::Busy(_) => "busy",
            Self::SessionNotFound(_) => "session_not_found",
            Self::Persistence(_) => "persistence_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::TrackNotFound(_) | Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidMessage(_) | Self::UrlRejected(_) => StatusCode::BAD_REQUEST,
            Self::Busy(_) => StatusCode::CONFLICT,
            Self::FetchFailed(_) | Self::TranscodeFailed(_) => StatusCode::BAD_GATEWAY,
            Self::Persistence(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type DuocastResult<T> = Result<T, DuocastError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for DuocastError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for DuocastError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
