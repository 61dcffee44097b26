//! Centralized error types for the e2cast core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses
//!
//! API responses never carry internal detail: 5xx errors render a generic
//! message and the full context goes to the server-side log only.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::encoder::EncoderError;
use crate::probe::ProbeError;
use crate::protocol_constants::DRAINING_RETRY_AFTER_SECS;
use crate::receiver::ReceiverError;
use crate::store::StoreError;

/// Trait for error types that provide machine-readable error codes.
pub trait ErrorCode {
    /// Returns a machine-readable error code for API responses and logs.
    fn code(&self) -> &'static str;
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        match self {
            Self::Backend(_) => "store_backend_error",
            Self::Codec(_) => "store_codec_error",
            Self::MissingPath(_) => "store_missing_path",
        }
    }
}

impl ErrorCode for ReceiverError {
    fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "receiver_timeout",
            Self::Connection(_) => "receiver_connection_error",
            Self::Http4xx(_) => "receiver_http_4xx",
            Self::Http5xx(_) => "receiver_http_5xx",
            Self::Decode(_) => "receiver_decode_error",
            Self::Cancelled => "receiver_cancelled",
            Self::EmptyPlaylist(_) => "receiver_empty_playlist",
        }
    }
}

impl ErrorCode for ProbeError {
    fn code(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "probe_spawn_failed",
            Self::Timeout(_) => "probe_timeout",
            Self::Failed(_) => "probe_failed",
            Self::Parse(_) => "probe_parse_error",
        }
    }
}

impl ErrorCode for EncoderError {
    fn code(&self) -> &'static str {
        match self {
            Self::Spawn(_) => "encoder_spawn_failed",
            Self::Stalled { .. } => "encoder_stalled",
            Self::WallClockExceeded { .. } => "encoder_wall_clock_exceeded",
            Self::Cancelled => "encoder_cancelled",
            Self::Exited { .. } => "encoder_exited",
        }
    }
}

/// Application-wide error type for the HTTP control plane.
#[derive(Debug, Error)]
pub enum E2castError {
    /// Unknown session id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The session existed but has been swept.
    #[error("session gone: {0}")]
    SessionGone(String),

    /// The artifact exists logically but is not ready to serve yet.
    #[error("session not ready: {0}")]
    NotReady(String),

    /// Client sent an invalid or malformed request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing, malformed or wrong bearer token.
    #[error("unauthorized")]
    Unauthorized,

    /// Valid token without the required scope.
    #[error("forbidden: missing scope {0}")]
    Forbidden(&'static str),

    /// Control plane is draining; retry later.
    #[error("draining")]
    Draining,

    /// Storage failed underneath a handler.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl E2castError {
    /// Returns a machine-readable error code for API responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionGone(_) => "session_gone",
            Self::NotReady(_) => "not_ready",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Draining => "draining",
            Self::Store(_) => "storage_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionGone(_) => StatusCode::GONE,
            Self::NotReady(_) => StatusCode::TOO_EARLY,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Draining => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for API operations.
pub type E2castResult<T> = Result<T, E2castError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for E2castError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal failures are logged with context and rendered opaque.
        let message = if status.is_server_error() && !matches!(self, Self::Draining) {
            log::error!("[Api] {} ({})", self, self.code());
            "internal error".to_string()
        } else {
            self.to_string()
        };
        let body = ErrorResponse {
            error: self.code(),
            message,
            status: status.as_u16(),
        };
        let mut response = (status, Json(body)).into_response();
        if matches!(self, Self::Draining) {
            response.headers_mut().insert(
                axum::http::header::RETRY_AFTER,
                axum::http::HeaderValue::from(DRAINING_RETRY_AFTER_SECS),
            );
        }
        response
    }
}
