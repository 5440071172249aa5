use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cursor::Cursor;

/// Per (message, recipient) delivery state. Ordered by rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Sent = 1,
    Delivered = 2,
    Read = 3,
}

impl ReceiptStatus {
    pub fn rank(self) -> i16 {
        self as i16
    }

    pub fn from_rank(rank: i16) -> Option<Self> {
        match rank {
            1 => Some(Self::Sent),
            2 => Some(Self::Delivered),
            3 => Some(Self::Read),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

/// A durably stored message as returned by the REST surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDto {
    pub id: i64,
    pub thread_id: Uuid,
    pub sender_id: Uuid,
    pub client_msg_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl MessageDto {
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.created_at, self.id)
    }
}

/// One page of history, always in ascending cursor order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessageDto>,
    pub has_more: bool,
}

impl MessagePage {
    pub fn newest_cursor(&self) -> Option<Cursor> {
        self.messages.iter().map(MessageDto::cursor).max()
    }

    pub fn oldest_cursor(&self) -> Option<Cursor> {
        self.messages.iter().map(MessageDto::cursor).min()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub client_msg_id: Uuid,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReceiptRequest {
    pub up_to_message_id: i64,
}

/// Result of a read/delivered cursor submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptAdvance {
    pub thread_id: Uuid,
    pub user_id: Uuid,
    pub up_to_message_id: i64,
    pub status: ReceiptStatus,
    /// Whether the participant cursor moved forward
    pub cursor_advanced: bool,
    /// Receipt rows inserted or raised by this call
    pub receipts_updated: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptBatchRequest {
    pub message_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptDto {
    pub message_id: i64,
    pub user_id: Uuid,
    pub status: ReceiptStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadDto {
    pub id: Uuid,
    pub participant_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub last_message: Option<Cursor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateThreadRequest {
    /// Other participants; the caller is always added
    pub participant_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadCount {
    pub thread_id: Uuid,
    pub unread: i64,
    pub last_read_message_id: Option<i64>,
}
