/// Wire schema shared by the DM sync service, its persistence workers and clients
///
/// Every payload that crosses a process boundary is defined here: REST DTOs,
/// push-channel frames, and the versioned events carried on the broker.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod broker;
pub mod cursor;
pub mod error;
pub mod frames;
pub mod message;
pub mod normalize;

pub use broker::{FanoutEvent, MessageSendEvent, MAX_BODY_BYTES};
pub use cursor::Cursor;
pub use error::EventError;
pub use frames::{ClientFrame, ServerFrame};
pub use normalize::{PersistedMessage, PushEvent};
pub use message::{
    CreateThreadRequest, MarkReceiptRequest, MessageDto, MessagePage, ReceiptAdvance,
    ReceiptBatchRequest, ReceiptDto, ReceiptStatus, SendMessageRequest, ThreadDto, UnreadCount,
};

/// Version stamped on every envelope this build produces
pub const SCHEMA_VERSION: u32 = 1;

/// Wrapper around every ingest entry. The payload is in `data`; the rest is
/// routing and tracing metadata that workers log but never interpret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    pub event_id: Uuid,
    /// When the producer built the envelope
    pub timestamp: DateTime<Utc>,
    pub schema_version: u32,
    /// Producer name, e.g. `ingress-gateway`
    pub source: String,
    /// The client message id for sends, so one logical send can be followed
    /// across redeliveries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub data: T,
}

impl<T> EventEnvelope<T> {
    pub fn new(source: impl Into<String>, data: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION,
            source: source.into(),
            correlation_id: None,
            data,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Only the exact version is accepted until a second one exists
    pub fn ensure_compatible(&self) -> Result<(), EventError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(EventError::IncompatibleVersion {
                expected: SCHEMA_VERSION,
                found: self.schema_version,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope_creation() {
        let event = MessageSendEvent {
            thread_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            client_msg_id: Uuid::new_v4(),
            body: "hi".to_string(),
            received_at: Utc::now(),
        };

        let envelope = EventEnvelope::new("ingress-gateway", event);
        assert_eq!(envelope.schema_version, SCHEMA_VERSION);
        assert_eq!(envelope.source, "ingress-gateway");
        assert!(envelope.correlation_id.is_none());
    }

    #[test]
    fn test_correlation_id_is_omitted_when_unset() {
        let envelope = EventEnvelope::new("test", 7u32);
        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("correlation_id").is_none());
        assert!(envelope.ensure_compatible().is_ok());

        let token = Uuid::new_v4();
        let json = serde_json::to_value(envelope.with_correlation_id(token)).unwrap();
        assert_eq!(json["correlation_id"], token.to_string());
    }
}
