use serde::{Deserialize, Serialize};

/// Uniform API error body returned by the DM sync service
///
/// Clients decide between "retry later" and "give up" from `code`, never from
/// the free-form `message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short HTTP reason phrase
    pub error: String,

    /// Human readable explanation
    pub message: String,

    /// HTTP status code
    pub status: u16,

    /// Error category, one of [`error_types`]
    pub error_type: String,

    /// Stable machine code, one of [`error_codes`]
    pub code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    /// ISO 8601
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, status: u16, error_type: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            status,
            error_type: error_type.to_string(),
            code: code.to_string(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether a client should keep the request in its outbox and retry
    pub fn is_retryable(&self) -> bool {
        error_codes::is_transient(&self.code)
    }
}

pub mod error_codes {
    // Authentication
    pub const TOKEN_INVALID: &str = "TOKEN_INVALID";
    pub const TOKEN_MISSING: &str = "TOKEN_MISSING";

    // Threads
    pub const THREAD_NOT_FOUND: &str = "THREAD_NOT_FOUND";
    pub const THREAD_ARCHIVED: &str = "THREAD_ARCHIVED";
    pub const NOT_THREAD_PARTICIPANT: &str = "NOT_THREAD_PARTICIPANT";
    pub const INVALID_PARTICIPANTS: &str = "INVALID_PARTICIPANTS";

    // Messages and receipts
    pub const MESSAGE_NOT_IN_THREAD: &str = "MESSAGE_NOT_IN_THREAD";
    pub const INVALID_MESSAGE_BODY: &str = "INVALID_MESSAGE_BODY";
    pub const INVALID_CURSOR: &str = "INVALID_CURSOR";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";

    // Database/System
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
    pub const QUEUE_UNAVAILABLE: &str = "QUEUE_UNAVAILABLE";
    pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";

    /// Codes a client may retry with the same idempotency token
    pub fn is_transient(code: &str) -> bool {
        matches!(
            code,
            DATABASE_ERROR | QUEUE_UNAVAILABLE | INTERNAL_SERVER_ERROR | SERVICE_UNAVAILABLE
        )
    }
}

pub mod error_types {
    pub const VALIDATION_ERROR: &str = "validation_error";
    pub const AUTHENTICATION_ERROR: &str = "authentication_error";
    pub const AUTHORIZATION_ERROR: &str = "authorization_error";
    pub const NOT_FOUND_ERROR: &str = "not_found_error";
    pub const CONFLICT_ERROR: &str = "conflict_error";
    pub const SERVER_ERROR: &str = "server_error";
    pub const SERVICE_UNAVAILABLE_ERROR: &str = "service_unavailable_error";
}
