use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Media permission denied: {0}")]
    MediaPermissionDenied(String),

    #[error("Media device not found: {0}")]
    MediaDeviceNotFound(String),

    #[error("Media error: {0}")]
    MediaError(String),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Signaling channel not ready for room {0}")]
    ChannelNotReady(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Negotiation error [{peer_id}]: {reason}")]
    Negotiation { peer_id: String, reason: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Call session closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether this error came from acquiring local media
    ///
    /// Callers of `join_room` and camera re-enable use this to tell a
    /// permission/device problem apart from a signaling failure.
    pub fn is_media_failure(&self) -> bool {
        matches!(
            self,
            AppError::MediaPermissionDenied(_)
                | AppError::MediaDeviceNotFound(_)
                | AppError::MediaError(_)
        )
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidState(_) | AppError::Config(_) => StatusCode::BAD_REQUEST,
            AppError::ChannelNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        tracing::error!(
            error_type = std::any::type_name_of_val(&self),
            error_message = %body.message,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
