use thiserror::Error;
use uuid::Uuid;

/// Failure talking to the service
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// Connect, timeout or reset; nothing is known about the request's effect
    #[error("network error: {0}")]
    Network(String),

    #[error("server rejected request ({status} {code}): {message}")]
    Server {
        status: u16,
        code: String,
        message: String,
    },

    #[error("undecodable response: {0}")]
    Decode(String),

    #[error("push channel disconnected")]
    Disconnected,
}

impl TransportError {
    /// Whether the same request may succeed later. Permanent rejections
    /// (validation, authorization, archived thread) are not retried.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Disconnected => true,
            TransportError::Server { status, code, .. } => {
                *status >= 500 || *status == 429 || error_types::error_codes::is_transient(code)
            }
            TransportError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            TransportError::Decode(e.to_string())
        } else {
            TransportError::Network(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("outbox encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error("invalid message body: {0}")]
    InvalidBody(String),

    #[error("unknown message {0}")]
    UnknownMessage(Uuid),

    #[error("message {0} is not in a retryable state")]
    NotRetryable(Uuid),

    #[error("session closed")]
    Closed,
}

pub type SyncResult<T> = Result<T, SyncError>;
