//! Boundary normalization of push payloads
//!
//! Producers disagree on field names (`thread_id` vs `conversationId`, `body` vs
//! `content`, epoch millis vs RFC 3339). Everything is folded into [`PushEvent`]
//! here so merge logic never branches on transport shape.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::cursor::Cursor;
use crate::error::EventError;
use crate::frames::ServerFrame;
use crate::message::{MessageDto, ReceiptStatus};

const TYPE_KEYS: &[&str] = &["type", "event", "kind"];
const THREAD_KEYS: &[&str] = &[
    "thread_id",
    "threadId",
    "conversation_id",
    "conversationId",
    "room_id",
];
const TOKEN_KEYS: &[&str] = &[
    "client_msg_id",
    "clientMsgId",
    "client_message_id",
    "clientMessageId",
    "idempotency_key",
    "idempotencyKey",
];
const SERVER_ID_KEYS: &[&str] = &[
    "server_message_id",
    "serverMessageId",
    "message_id",
    "messageId",
    "id",
];
const CREATED_KEYS: &[&str] = &[
    "server_created_at",
    "serverCreatedAt",
    "created_at",
    "createdAt",
    "timestamp",
];
const SENDER_KEYS: &[&str] = &["sender_id", "senderId", "user_id", "userId", "from"];
const BODY_KEYS: &[&str] = &["body", "content", "text", "message"];
const TYPING_KEYS: &[&str] = &["typing", "is_typing", "isTyping"];
const ONLINE_KEYS: &[&str] = &["online", "is_online", "isOnline"];
const UP_TO_KEYS: &[&str] = &[
    "up_to_message_id",
    "upToMessageId",
    "last_read_message_id",
    "message_id",
];

/// A message that has a canonical server id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedMessage {
    pub thread_id: Uuid,
    /// Absent when the producer did not echo the idempotency token
    pub client_msg_id: Option<Uuid>,
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub sender_id: Uuid,
    pub body: String,
}

impl PersistedMessage {
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.created_at, self.id)
    }
}

impl From<MessageDto> for PersistedMessage {
    fn from(m: MessageDto) -> Self {
        Self {
            thread_id: m.thread_id,
            client_msg_id: Some(m.client_msg_id),
            id: m.id,
            created_at: m.created_at,
            sender_id: m.sender_id,
            body: m.body,
        }
    }
}

/// The single event type consumed by client merge logic
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Ack {
        thread_id: Uuid,
        client_msg_id: Uuid,
        sender_id: Option<Uuid>,
        body: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Persisted(PersistedMessage),
    Typing {
        thread_id: Uuid,
        user_id: Uuid,
        typing: bool,
    },
    Presence {
        thread_id: Uuid,
        user_id: Uuid,
        online: bool,
    },
    Receipt {
        thread_id: Uuid,
        user_id: Uuid,
        up_to_message_id: i64,
        status: ReceiptStatus,
    },
    Rejected {
        thread_id: Uuid,
        client_msg_id: Option<Uuid>,
        code: String,
        message: String,
    },
}

impl PushEvent {
    pub fn thread_id(&self) -> Uuid {
        match self {
            Self::Ack { thread_id, .. }
            | Self::Typing { thread_id, .. }
            | Self::Presence { thread_id, .. }
            | Self::Receipt { thread_id, .. }
            | Self::Rejected { thread_id, .. } => *thread_id,
            Self::Persisted(m) => m.thread_id,
        }
    }

    /// Parse a frame as received from the transport
    pub fn from_json(text: &str) -> Result<Self, EventError> {
        if let Ok(frame) = serde_json::from_str::<ServerFrame>(text) {
            return Ok(frame.into());
        }
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    /// Duck-typed decoding of an arbitrary JSON object
    pub fn from_value(value: &Value) -> Result<Self, EventError> {
        let fields = Fields::new(value)?;
        let kind = fields
            .string(TYPE_KEYS)
            .ok_or(EventError::MissingField("type"))?;
        let thread_id = fields.uuid(THREAD_KEYS, "thread_id")?;

        match kind.as_str() {
            "message_ack" | "message.ack" | "ack" => Ok(Self::Ack {
                thread_id,
                client_msg_id: fields.uuid(TOKEN_KEYS, "client_msg_id")?,
                sender_id: fields.opt_uuid(SENDER_KEYS, "sender_id")?,
                body: fields.string(BODY_KEYS),
                timestamp: fields.timestamp(CREATED_KEYS, "timestamp")?,
            }),
            "message_persisted"
            | "message.persisted"
            | "message.new"
            | "new_message"
            | "persisted" => {
                Ok(Self::Persisted(PersistedMessage {
                    thread_id,
                    client_msg_id: fields.opt_uuid(TOKEN_KEYS, "client_msg_id")?,
                    id: fields.int(SERVER_ID_KEYS, "server_message_id")?,
                    created_at: fields.timestamp(CREATED_KEYS, "server_created_at")?,
                    sender_id: fields.uuid(SENDER_KEYS, "sender_id")?,
                    body: fields
                        .string(BODY_KEYS)
                        .ok_or(EventError::MissingField("body"))?,
                }))
            }
            "typing" | "typing.started" | "typing.stopped" => Ok(Self::Typing {
                thread_id,
                user_id: fields.uuid(SENDER_KEYS, "user_id")?,
                typing: fields
                    .bool(TYPING_KEYS)
                    .unwrap_or(kind.as_str() != "typing.stopped"),
            }),
            "presence" => Ok(Self::Presence {
                thread_id,
                user_id: fields.uuid(SENDER_KEYS, "user_id")?,
                online: fields
                    .bool(ONLINE_KEYS)
                    .ok_or(EventError::MissingField("online"))?,
            }),
            "receipt_updated" | "receipt" | "read_receipt" => {
                let status = match fields.string(&["status", "state"]) {
                    Some(s) => parse_status(&s)?,
                    None if kind == "read_receipt" => ReceiptStatus::Read,
                    None => return Err(EventError::MissingField("status")),
                };
                Ok(Self::Receipt {
                    thread_id,
                    user_id: fields.uuid(SENDER_KEYS, "user_id")?,
                    up_to_message_id: fields.int(UP_TO_KEYS, "up_to_message_id")?,
                    status,
                })
            }
            "error" => Ok(Self::Rejected {
                thread_id,
                client_msg_id: fields.opt_uuid(TOKEN_KEYS, "client_msg_id")?,
                code: fields.string(&["code"]).unwrap_or_default(),
                message: fields.string(&["message", "error"]).unwrap_or_default(),
            }),
            other => Err(EventError::UnknownType(other.to_string())),
        }
    }
}

impl From<ServerFrame> for PushEvent {
    fn from(frame: ServerFrame) -> Self {
        match frame {
            ServerFrame::MessageAck {
                thread_id,
                client_msg_id,
                sender_id,
                body,
                timestamp,
            } => Self::Ack {
                thread_id,
                client_msg_id,
                sender_id: Some(sender_id),
                body: Some(body),
                timestamp,
            },
            ServerFrame::MessagePersisted {
                thread_id,
                client_msg_id,
                server_message_id,
                server_created_at,
                sender_id,
                body,
            } => Self::Persisted(PersistedMessage {
                thread_id,
                client_msg_id: Some(client_msg_id),
                id: server_message_id,
                created_at: server_created_at,
                sender_id,
                body,
            }),
            ServerFrame::Typing {
                thread_id,
                user_id,
                typing,
            } => Self::Typing {
                thread_id,
                user_id,
                typing,
            },
            ServerFrame::Presence {
                thread_id,
                user_id,
                online,
            } => Self::Presence {
                thread_id,
                user_id,
                online,
            },
            ServerFrame::ReceiptUpdated {
                thread_id,
                user_id,
                up_to_message_id,
                status,
            } => Self::Receipt {
                thread_id,
                user_id,
                up_to_message_id,
                status,
            },
            ServerFrame::Error {
                thread_id,
                client_msg_id,
                code,
                message,
            } => Self::Rejected {
                thread_id,
                client_msg_id,
                code,
                message,
            },
        }
    }
}

fn parse_status(raw: &str) -> Result<ReceiptStatus, EventError> {
    match raw.to_ascii_lowercase().as_str() {
        "sent" => Ok(ReceiptStatus::Sent),
        "delivered" => Ok(ReceiptStatus::Delivered),
        "read" | "seen" => Ok(ReceiptStatus::Read),
        other => Err(EventError::InvalidField {
            field: "status",
            reason: format!("unknown receipt status {other}"),
        }),
    }
}

/// Top-level object plus an optional nested `data`/`payload` object
struct Fields<'a> {
    layers: Vec<&'a Map<String, Value>>,
}

impl<'a> Fields<'a> {
    fn new(value: &'a Value) -> Result<Self, EventError> {
        let top = value.as_object().ok_or_else(|| EventError::InvalidField {
            field: "frame",
            reason: "expected a JSON object".to_string(),
        })?;
        let mut layers = vec![top];
        for key in ["data", "payload"] {
            if let Some(nested) = top.get(key).and_then(Value::as_object) {
                layers.push(nested);
            }
        }
        Ok(Self { layers })
    }

    fn get(&self, keys: &[&str]) -> Option<&'a Value> {
        self.layers.iter().find_map(|layer| {
            keys.iter()
                .find_map(|k| layer.get(*k).filter(|v| !v.is_null()))
        })
    }

    fn string(&self, keys: &[&str]) -> Option<String> {
        self.get(keys).and_then(Value::as_str).map(str::to_string)
    }

    fn bool(&self, keys: &[&str]) -> Option<bool> {
        self.get(keys).and_then(Value::as_bool)
    }

    fn opt_uuid(&self, keys: &[&str], field: &'static str) -> Result<Option<Uuid>, EventError> {
        match self.get(keys) {
            None => Ok(None),
            Some(Value::String(s)) => Uuid::parse_str(s)
                .map(Some)
                .map_err(|e| EventError::InvalidField {
                    field,
                    reason: e.to_string(),
                }),
            Some(other) => Err(EventError::InvalidField {
                field,
                reason: format!("expected uuid string, got {other}"),
            }),
        }
    }

    fn uuid(&self, keys: &[&str], field: &'static str) -> Result<Uuid, EventError> {
        self.opt_uuid(keys, field)?
            .ok_or(EventError::MissingField(field))
    }

    fn int(&self, keys: &[&str], field: &'static str) -> Result<i64, EventError> {
        match self.get(keys) {
            None => Err(EventError::MissingField(field)),
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| EventError::InvalidField {
                field,
                reason: format!("not an integer: {n}"),
            }),
            Some(Value::String(s)) => s.parse().map_err(|_| EventError::InvalidField {
                field,
                reason: format!("not an integer: {s}"),
            }),
            Some(other) => Err(EventError::InvalidField {
                field,
                reason: format!("not an integer: {other}"),
            }),
        }
    }

    fn timestamp(&self, keys: &[&str], field: &'static str) -> Result<DateTime<Utc>, EventError> {
        match self.get(keys) {
            None => Err(EventError::MissingField(field)),
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| EventError::InvalidField {
                    field,
                    reason: e.to_string(),
                }),
            Some(Value::Number(n)) => n
                .as_i64()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .ok_or_else(|| EventError::InvalidField {
                    field,
                    reason: format!("bad epoch millis: {n}"),
                }),
            Some(other) => Err(EventError::InvalidField {
                field,
                reason: format!("not a timestamp: {other}"),
            }),
        }
    }
}
