use crate::broker::BrokerError;
use crate::middleware::error_handling;
use crate::store::StoreError;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        actix_web::http::StatusCode::from_u16(AppError::status_code(self))
            .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        error_handling::into_response(self)
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid message body: {0}")]
    InvalidBody(String),

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not a participant of this thread")]
    Forbidden,

    #[error("thread not found")]
    ThreadNotFound,

    #[error("thread is archived")]
    ThreadArchived,

    #[error("message {0} does not belong to this thread")]
    MessageNotInThread(i64),

    #[error("invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("internal server error")]
    Internal,
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ThreadNotFound => AppError::ThreadNotFound,
            StoreError::MessageNotInThread(id) => AppError::MessageNotInThread(id),
            StoreError::InvalidParticipants(msg) => AppError::InvalidParticipants(msg),
            other => AppError::Database(other.to_string()),
        }
    }
}

impl From<BrokerError> for AppError {
    fn from(e: BrokerError) -> Self {
        AppError::QueueUnavailable(e.to_string())
    }
}

impl AppError {
    /// Whether the caller may retry with the same idempotency token
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::QueueUnavailable(_) | AppError::Internal
        )
    }

    /// Returns HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_)
            | AppError::InvalidBody(_)
            | AppError::InvalidCursor(_)
            | AppError::InvalidParticipants(_) => 400,
            AppError::Unauthorized => 401,
            AppError::Forbidden => 403,
            AppError::ThreadNotFound => 404,
            AppError::ThreadArchived => 409,
            AppError::MessageNotInThread(_) => 422,
            AppError::QueueUnavailable(_) => 503,
            AppError::Config(_)
            | AppError::StartServer(_)
            | AppError::Database(_)
            | AppError::Internal => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_domain_errors() {
        assert!(matches!(
            AppError::from(StoreError::ThreadNotFound),
            AppError::ThreadNotFound
        ));
        assert!(matches!(
            AppError::from(StoreError::MessageNotInThread(7)),
            AppError::MessageNotInThread(7)
        ));
        let unavailable = AppError::from(StoreError::Unavailable("pool timed out".into()));
        assert!(unavailable.is_retryable());
        assert_eq!(unavailable.status_code(), 500);
    }

    #[test]
    fn test_queue_errors_are_retryable_503() {
        let err = AppError::QueueUnavailable("broken pipe".into());
        assert!(err.is_retryable());
        assert_eq!(err.status_code(), 503);
        assert!(!AppError::Forbidden.is_retryable());
    }
}
