//! Push-channel frames
//!
//! Every frame carries `thread_id`. Client frames flow client -> gateway,
//! server frames flow gateway -> every connection subscribed to the thread.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cursor::Cursor;
use crate::message::{MessageDto, ReceiptStatus};

/// Inbound frames from a client connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "send_message")]
    SendMessage {
        thread_id: Uuid,
        body: String,
        client_msg_id: Uuid,
    },

    #[serde(rename = "typing")]
    Typing { thread_id: Uuid, typing: bool },

    #[serde(rename = "presence")]
    Presence { thread_id: Uuid, online: bool },

    #[serde(rename = "delivered")]
    Delivered {
        thread_id: Uuid,
        up_to_message_id: i64,
    },

    #[serde(rename = "mark_read")]
    MarkRead {
        thread_id: Uuid,
        up_to_message_id: i64,
    },
}

impl ClientFrame {
    pub fn thread_id(&self) -> Uuid {
        match self {
            Self::SendMessage { thread_id, .. }
            | Self::Typing { thread_id, .. }
            | Self::Presence { thread_id, .. }
            | Self::Delivered { thread_id, .. }
            | Self::MarkRead { thread_id, .. } => *thread_id,
        }
    }

    /// Client token of a send, echoed on its error frame
    pub fn client_msg_id(&self) -> Option<Uuid> {
        match self {
            Self::SendMessage { client_msg_id, .. } => Some(*client_msg_id),
            _ => None,
        }
    }
}

/// Outbound frames broadcast to a thread's room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Fast acknowledgment, issued before the message is durable
    #[serde(rename = "message_ack")]
    MessageAck {
        thread_id: Uuid,
        client_msg_id: Uuid,
        sender_id: Uuid,
        body: String,
        timestamp: DateTime<Utc>,
    },

    /// Issued once the row is durably stored; carries the canonical id
    #[serde(rename = "message_persisted")]
    MessagePersisted {
        thread_id: Uuid,
        client_msg_id: Uuid,
        server_message_id: i64,
        server_created_at: DateTime<Utc>,
        sender_id: Uuid,
        body: String,
    },

    #[serde(rename = "typing")]
    Typing {
        thread_id: Uuid,
        user_id: Uuid,
        typing: bool,
    },

    #[serde(rename = "presence")]
    Presence {
        thread_id: Uuid,
        user_id: Uuid,
        online: bool,
    },

    /// A participant advanced their delivered/read cursor
    #[serde(rename = "receipt_updated")]
    ReceiptUpdated {
        thread_id: Uuid,
        user_id: Uuid,
        up_to_message_id: i64,
        status: ReceiptStatus,
    },

    /// Sent only to the originating connection when a frame is rejected
    #[serde(rename = "error")]
    Error {
        thread_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_msg_id: Option<Uuid>,
        code: String,
        message: String,
    },
}

impl ServerFrame {
    pub fn persisted(message: &MessageDto) -> Self {
        Self::MessagePersisted {
            thread_id: message.thread_id,
            client_msg_id: message.client_msg_id,
            server_message_id: message.id,
            server_created_at: message.created_at,
            sender_id: message.sender_id,
            body: message.body.clone(),
        }
    }

    pub fn thread_id(&self) -> Uuid {
        match self {
            Self::MessageAck { thread_id, .. }
            | Self::MessagePersisted { thread_id, .. }
            | Self::Typing { thread_id, .. }
            | Self::Presence { thread_id, .. }
            | Self::ReceiptUpdated { thread_id, .. }
            | Self::Error { thread_id, .. } => *thread_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::MessageAck { .. } => "message_ack",
            Self::MessagePersisted { .. } => "message_persisted",
            Self::Typing { .. } => "typing",
            Self::Presence { .. } => "presence",
            Self::ReceiptUpdated { .. } => "receipt_updated",
            Self::Error { .. } => "error",
        }
    }

    /// Cursor of the message this frame describes, if it is a persisted message
    pub fn cursor(&self) -> Option<Cursor> {
        match self {
            Self::MessagePersisted {
                server_message_id,
                server_created_at,
                ..
            } => Some(Cursor::new(*server_created_at, *server_message_id)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
