//! Events carried on the broker streams
//!
//! Ingest stream entries hold one `EventEnvelope<MessageSendEvent>` under the
//! `event` field. Fanout stream entries hold one `FanoutEvent` under the same field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::EventError;
use crate::frames::ServerFrame;
use crate::EventEnvelope;

/// Stream field holding the serialized event
pub const EVENT_FIELD: &str = "event";
/// Stream field duplicating the thread id for inspection with redis-cli
pub const THREAD_FIELD: &str = "thread_id";

/// Upper bound on a message body, in bytes
pub const MAX_BODY_BYTES: usize = 16 * 1024;

/// A validated send request on its way to durable storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSendEvent {
    pub thread_id: Uuid,
    pub sender_id: Uuid,
    pub client_msg_id: Uuid,
    pub body: String,
    /// Gateway receive time, echoed in the fast ack
    pub received_at: DateTime<Utc>,
}

impl MessageSendEvent {
    pub fn validate(&self, max_body_bytes: usize) -> Result<(), EventError> {
        validate_body(&self.body, max_body_bytes)
    }

    pub fn to_fields(
        envelope: &EventEnvelope<Self>,
    ) -> Result<Vec<(&'static str, String)>, EventError> {
        Ok(vec![
            (EVENT_FIELD, serde_json::to_string(envelope)?),
            (THREAD_FIELD, envelope.data.thread_id.to_string()),
        ])
    }

    /// Decode a stream entry. Fails deterministically on bad input.
    pub fn from_fields(
        fields: &HashMap<String, String>,
    ) -> Result<EventEnvelope<Self>, EventError> {
        let raw = fields
            .get(EVENT_FIELD)
            .ok_or(EventError::MissingField(EVENT_FIELD))?;
        let envelope: EventEnvelope<Self> = serde_json::from_str(raw)?;
        envelope.ensure_compatible()?;
        Ok(envelope)
    }
}

pub fn validate_body(body: &str, max_body_bytes: usize) -> Result<(), EventError> {
    if body.trim().is_empty() {
        return Err(EventError::InvalidField {
            field: "body",
            reason: "body is empty".to_string(),
        });
    }
    if body.len() > max_body_bytes {
        return Err(EventError::InvalidField {
            field: "body",
            reason: format!("body is {} bytes, limit {}", body.len(), max_body_bytes),
        });
    }
    Ok(())
}

/// A server frame relayed between gateway instances.
///
/// `origin` names the publisher so an instance can skip frames it already
/// delivered to its own connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutEvent {
    pub origin: String,
    pub frame: ServerFrame,
}

impl FanoutEvent {
    pub fn new(origin: impl Into<String>, frame: ServerFrame) -> Self {
        Self {
            origin: origin.into(),
            frame,
        }
    }

    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, EventError> {
        Ok(vec![
            (EVENT_FIELD, serde_json::to_string(self)?),
            (THREAD_FIELD, self.frame.thread_id().to_string()),
        ])
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, EventError> {
        let raw = fields
            .get(EVENT_FIELD)
            .ok_or(EventError::MissingField(EVENT_FIELD))?;
        Ok(serde_json::from_str(raw)?)
    }
}
