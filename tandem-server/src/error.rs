//! Error types for tandem-server
//!
//! Request-scoped errors (authorization, invalid state) are returned to the
//! caller immediately and never retried. Delivery problems are logged by the
//! broadcaster and never fail a request.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tandem_common::api::ErrorResponse;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for tandem-server
#[derive(Error, Debug)]
pub enum Error {
    /// Caller is not the room's administrator
    #[error("Only the room administrator can {action}")]
    Authorization { action: String },

    /// Caller identity missing or malformed
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Transition not allowed from the current playback state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Room unknown to the room directory
    #[error("Room not found: {0}")]
    RoomNotFound(Uuid),

    /// Track unknown to the track catalog
    #[error("Track not found: {0}")]
    TrackNotFound(Uuid),

    /// Invalid request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Critical event not confirmed by every subscriber in time
    #[error("Delivery timeout: event {event_id} unconfirmed by {missing} subscriber(s)")]
    DeliveryTimeout { event_id: Uuid, missing: usize },

    /// Neither delivery path reached any subscriber
    #[error("Broadcast error: {0}")]
    Broadcast(String),

    /// HTTP server errors
    #[error("HTTP server error: {0}")]
    Http(String),

    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors from shared code (serialization, config loading)
    #[error(transparent)]
    Common(#[from] tandem_common::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using tandem-server Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Machine-readable kind used in error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Authorization { .. } => "authorization_error",
            Error::Unauthenticated(_) => "unauthenticated",
            Error::InvalidState(_) => "invalid_state_error",
            Error::RoomNotFound(_) | Error::TrackNotFound(_) => "not_found",
            Error::BadRequest(_) => "bad_request",
            Error::DeliveryTimeout { .. } => "delivery_timeout_error",
            Error::Broadcast(_) => "broadcast_error",
            Error::Http(_)
            | Error::Config(_)
            | Error::Common(_)
            | Error::Io(_)
            | Error::Internal(_) => "internal_error",
        }
    }

    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Authorization { .. } => StatusCode::FORBIDDEN,
            Error::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Error::InvalidState(_) => StatusCode::CONFLICT,
            Error::RoomNotFound(_) | Error::TrackNotFound(_) => StatusCode::NOT_FOUND,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected ({}): {}", status, self);
        }
        let body = ErrorResponse {
            error: self.kind().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_message_mentions_administrator() {
        let err = Error::Authorization {
            action: "pause playback".to_string(),
        };
        assert!(err.to_string().contains("administrator"));
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(err.kind(), "authorization_error");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::InvalidState("x".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::RoomNotFound(Uuid::nil()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
