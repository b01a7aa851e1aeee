use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Device busy: {current} is streaming")]
    DeviceConflict { current: String, requested: String },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Invalid fMP4 stream: {0}")]
    Mp4Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

/// Conflict response body, mirrors the stream-join contract
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResponse {
    pub current_device: String,
    pub requested_device: String,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::DeviceConflict { .. } => StatusCode::CONFLICT,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if let AppError::DeviceConflict { current, requested } = self {
            return (
                status,
                Json(ConflictResponse {
                    current_device: current,
                    requested_device: requested,
                }),
            )
                .into_response();
        }

        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
        };

        tracing::debug!(
            status = %status,
            error_message = %body.message,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
