use chrono::{DateTime, Utc};
use event_schema::{Cursor, ReceiptStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client-visible lifecycle of one message.
///
/// `Sending -> Sent -> Delivered -> Read`, plus `Failed`, reachable only from
/// `Sending` and left again only through a retry back to `Sending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Failed,
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    /// Progress rank; `Sending` and `Failed` share the lowest rank
    pub fn rank(self) -> u8 {
        match self {
            Self::Sending | Self::Failed => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
        }
    }

    pub fn is_confirmed(self) -> bool {
        self.rank() > 0
    }

    /// The higher of two statuses; never moves backwards
    pub fn advance_to(self, other: MessageStatus) -> MessageStatus {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl From<ReceiptStatus> for MessageStatus {
    fn from(status: ReceiptStatus) -> Self {
        match status {
            ReceiptStatus::Sent => Self::Sent,
            ReceiptStatus::Delivered => Self::Delivered,
            ReceiptStatus::Read => Self::Read,
        }
    }
}

/// One entry of the rendered timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalMessage {
    /// Stable id for the view, assigned when the entry first appears
    pub local_id: Uuid,
    /// Idempotency token, when known
    pub client_msg_id: Option<Uuid>,
    /// Canonical id, present once the row is durable
    pub server_id: Option<i64>,
    pub thread_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    /// Server timestamp once persisted; local or ack time before that
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
}

impl LocalMessage {
    pub fn is_persisted(&self) -> bool {
        self.server_id.is_some()
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.server_id.map(|id| Cursor::new(self.created_at, id))
    }
}

/// What a UI renders for one open conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThreadSnapshot {
    pub thread_id: Uuid,
    /// Persisted messages in cursor order, followed by unconfirmed ones in the
    /// order they were created
    pub messages: Vec<LocalMessage>,
    pub typing: Vec<Uuid>,
    pub online: Vec<Uuid>,
    pub pending_outbox: usize,
    pub connected: bool,
    pub has_older: bool,
}
