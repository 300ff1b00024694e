use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Errors the relay surfaces to its callers.
///
/// Operational faults (transport timeouts, resolver failures, scheduling
/// failures) are logged and never returned. Only caller bugs end up here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl RelayError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

/// Errors returned by the HTTP surface
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Relay(RelayError::InvalidArgument(msg)) => {
                (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", msg.clone())
            }
        };

        tracing::warn!(
            code = %code,
            status = %status.as_u16(),
            message = %message,
            "API request rejected"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
