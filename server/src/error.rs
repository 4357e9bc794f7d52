//! Unified error handling for the server.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use ward_engine::ErrorKind;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Engine(#[from] ward_engine::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl AppError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Engine(e) => match e.kind() {
                ErrorKind::Scope | ErrorKind::Validation | ErrorKind::Cursor => {
                    StatusCode::BAD_REQUEST
                }
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::Session => match e {
                    ward_engine::Error::SessionNotFound(_) => StatusCode::NOT_FOUND,
                    _ => StatusCode::GONE,
                },
                ErrorKind::Isolation => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_message, details) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                ("Database error".to_string(), None)
            }
            AppError::Engine(e) => {
                if status.is_server_error() {
                    tracing::error!(kind = ?e.kind(), "Engine error: {}", e);
                } else {
                    tracing::warn!(kind = ?e.kind(), "Engine error: {}", e);
                }
                (format!("{:?}", e.kind()), Some(e.to_string()))
            }
            AppError::BadRequest(msg) => ("Invalid request".to_string(), Some(msg.clone())),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ward_engine::Error;

    #[test]
    fn engine_errors_map_to_statuses() {
        let id = uuid::Uuid::nil();
        let cases = [
            (Error::UnknownEntity("x".into()), StatusCode::BAD_REQUEST),
            (Error::MissingId, StatusCode::BAD_REQUEST),
            (Error::InvalidCursor("x".into()), StatusCode::BAD_REQUEST),
            (
                Error::Conflict {
                    entity: "patient".into(),
                    id: "a".into(),
                },
                StatusCode::CONFLICT,
            ),
            (Error::SessionNotFound(id), StatusCode::NOT_FOUND),
            (Error::SessionCompleted(id), StatusCode::GONE),
            (
                Error::IsolationViolation {
                    entity: "patient".into(),
                    reason: "gone".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status(), status);
        }
    }

    #[test]
    fn bad_request_is_400() {
        assert_eq!(
            AppError::BadRequest("nope".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
