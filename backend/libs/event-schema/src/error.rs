use thiserror::Error;

/// Errors raised while decoding or validating a wire payload.
///
/// Every variant is deterministic: retrying the same bytes yields the same error,
/// which is what lets consumers dead-letter instead of redelivering.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unknown event type: {0}")]
    UnknownType(String),

    #[error("unsupported schema version {found} (expected {expected})")]
    IncompatibleVersion { expected: u32, found: u32 },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
