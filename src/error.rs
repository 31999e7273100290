use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Calendar API error ({status}): {message}")]
    CalendarApi { status: u16, message: String },

    #[error("Work item API error ({status}): {message}")]
    WorkItemApi { status: u16, message: String },

    #[error("Authentication rejected: {0}")]
    Credentials(String),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("External service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AppError {
    /// Whether a retry with backoff is worth attempting.
    ///
    /// Rate limits, 5xx responses from either external service, and network
    /// failures are considered transient. Everything else (bad credentials,
    /// malformed data, 4xx rejections) is permanent and escalates straight
    /// to a per-item failure.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::RateLimited | AppError::ServiceUnavailable(_) => true,
            AppError::CalendarApi { status, .. } | AppError::WorkItemApi { status, .. } => {
                *status == 429 || *status >= 500
            }
            AppError::Request(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status()
                        .map_or(true, |s| s.as_u16() == 429 || s.is_server_error())
            }
            _ => false,
        }
    }

    /// Fatal errors abort the run immediately and leave the checkpoint
    /// untouched for a later resume.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Database(_) | AppError::Credentials(_))
    }
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
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                self.to_string(),
            ),
            AppError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                msg.clone(),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::Request(e) => {
                tracing::error!("HTTP request error: {:?}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    "EXTERNAL_REQUEST_FAILED",
                    "Failed to communicate with external service".to_string(),
                )
            }
            AppError::CalendarApi { .. } => {
                tracing::error!("Calendar API error: {}", self);
                (
                    StatusCode::BAD_GATEWAY,
                    "CALENDAR_API_ERROR",
                    self.to_string(),
                )
            }
            AppError::WorkItemApi { .. } => {
                tracing::error!("Work item API error: {}", self);
                (
                    StatusCode::BAD_GATEWAY,
                    "WORK_ITEM_API_ERROR",
                    self.to_string(),
                )
            }
            AppError::Credentials(msg) => {
                tracing::error!("Credential rejection: {}", msg);
                (StatusCode::BAD_GATEWAY, "CREDENTIALS_REJECTED", msg.clone())
            }
            AppError::MalformedRecord(msg) => {
                tracing::warn!("Malformed record: {}", msg);
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "MALFORMED_RECORD",
                    msg.clone(),
                )
            }
            AppError::Config(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    "Server configuration error".to_string(),
                )
            }
            AppError::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                msg.clone(),
            ),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(AppError::RateLimited.is_transient());
        assert!(AppError::WorkItemApi {
            status: 503,
            message: "busy".into()
        }
        .is_transient());
        assert!(AppError::CalendarApi {
            status: 429,
            message: "throttled".into()
        }
        .is_transient());
        assert!(!AppError::WorkItemApi {
            status: 404,
            message: "gone".into()
        }
        .is_transient());
        assert!(!AppError::Validation("bad".into()).is_transient());
    }

    #[test]
    fn fatal_classification() {
        assert!(AppError::Credentials("expired PAT".into()).is_fatal());
        assert!(!AppError::RateLimited.is_fatal());
        assert!(!AppError::MalformedRecord("no start time".into()).is_fatal());
    }
}
