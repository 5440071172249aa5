use crate::error::AppError;
use actix_web::{http::StatusCode, HttpResponse};
use error_types::{error_codes, error_types as kinds, ErrorResponse};

/// Map a domain error to its HTTP status and JSON body
pub fn map_error(err: &AppError) -> (StatusCode, ErrorResponse) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let (error_type, code) = match err {
        AppError::BadRequest(_) => (kinds::VALIDATION_ERROR, error_codes::INVALID_REQUEST),
        AppError::InvalidBody(_) => (kinds::VALIDATION_ERROR, error_codes::INVALID_MESSAGE_BODY),
        AppError::InvalidCursor(_) => (kinds::VALIDATION_ERROR, error_codes::INVALID_CURSOR),
        AppError::InvalidParticipants(_) => {
            (kinds::VALIDATION_ERROR, error_codes::INVALID_PARTICIPANTS)
        }
        AppError::Unauthorized => (kinds::AUTHENTICATION_ERROR, error_codes::TOKEN_INVALID),
        AppError::Forbidden => (kinds::AUTHORIZATION_ERROR, error_codes::NOT_THREAD_PARTICIPANT),
        AppError::ThreadNotFound => (kinds::NOT_FOUND_ERROR, error_codes::THREAD_NOT_FOUND),
        AppError::ThreadArchived => (kinds::CONFLICT_ERROR, error_codes::THREAD_ARCHIVED),
        AppError::MessageNotInThread(_) => {
            (kinds::VALIDATION_ERROR, error_codes::MESSAGE_NOT_IN_THREAD)
        }
        AppError::Database(_) => (kinds::SERVER_ERROR, error_codes::DATABASE_ERROR),
        AppError::QueueUnavailable(_) => {
            (kinds::SERVICE_UNAVAILABLE_ERROR, error_codes::QUEUE_UNAVAILABLE)
        }
        AppError::Config(_) | AppError::StartServer(_) | AppError::Internal => {
            (kinds::SERVER_ERROR, error_codes::INTERNAL_SERVER_ERROR)
        }
    };

    // Storage and broker internals stay in the logs
    let message = match err {
        AppError::Database(_) => "storage temporarily unavailable".to_string(),
        AppError::QueueUnavailable(_) => "message queue temporarily unavailable".to_string(),
        other => other.to_string(),
    };

    let response = ErrorResponse::new(
        status.canonical_reason().unwrap_or("Error"),
        &message,
        status.as_u16(),
        error_type,
        code,
    );

    (status, response)
}

pub fn into_response(err: &AppError) -> HttpResponse {
    if err.status_code() >= 500 {
        tracing::error!(error = %err, "request failed");
    }
    let (status, response) = map_error(err);
    HttpResponse::build(status).json(response)
}
