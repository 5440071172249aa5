//! Durable message storage
//!
//! The `(thread_id, client_msg_id)` uniqueness constraint is what turns
//! at-least-once delivery from the broker into exactly one stored row. Every
//! implementation must enforce it.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use event_schema::{MessagePage, ReceiptAdvance, ReceiptDto, ReceiptStatus, UnreadCount};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    InsertOutcome, NewMessage, PageQuery, Thread, MAX_PARTICIPANTS, MIN_PARTICIPANTS,
};

pub use memory::MemoryMessageStore;
pub use postgres::PgMessageStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("thread not found")]
    ThreadNotFound,

    #[error("message {0} does not belong to this thread")]
    MessageNotInThread(i64),

    #[error("invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Whether repeating the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Database(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Create a thread for `creator` plus `others`. Two-party threads are
    /// deduplicated: asking again returns the existing thread.
    async fn create_thread(&self, creator: Uuid, others: &[Uuid]) -> StoreResult<Thread>;

    async fn get_thread(&self, thread_id: Uuid) -> StoreResult<Thread>;

    /// Idempotent; archiving twice keeps the first timestamp
    async fn archive_thread(&self, thread_id: Uuid) -> StoreResult<Thread>;

    /// Insert unless `(thread_id, client_msg_id)` exists, in which case the
    /// stored row is returned with `created = false`
    async fn insert_message(&self, message: &NewMessage) -> StoreResult<InsertOutcome>;

    /// Messages are returned in ascending cursor order whatever the query direction
    async fn list_messages(&self, thread_id: Uuid, query: PageQuery) -> StoreResult<MessagePage>;

    /// Move the user's delivered/read cursor to `up_to_message_id` and raise the
    /// receipts of every message they received up to it. Never lowers a receipt.
    async fn advance_receipts(
        &self,
        thread_id: Uuid,
        user_id: Uuid,
        up_to_message_id: i64,
        status: ReceiptStatus,
    ) -> StoreResult<ReceiptAdvance>;

    /// Receipts other participants hold on `caller`'s own messages. Ids with no
    /// matching row are omitted.
    async fn receipts_for(
        &self,
        thread_id: Uuid,
        caller: Uuid,
        message_ids: &[i64],
    ) -> StoreResult<Vec<ReceiptDto>>;

    async fn unread_count(&self, thread_id: Uuid, user_id: Uuid) -> StoreResult<UnreadCount>;

    async fn record_dead_letter(
        &self,
        entry_id: &str,
        reason: &str,
        payload: &serde_json::Value,
    ) -> StoreResult<()>;
}

/// Creator plus others, sorted and deduplicated, within the allowed size
pub fn normalize_participants(creator: Uuid, others: &[Uuid]) -> StoreResult<Vec<Uuid>> {
    let mut all: Vec<Uuid> = others.to_vec();
    all.push(creator);
    all.sort();
    all.dedup();

    if all.len() < MIN_PARTICIPANTS {
        return Err(StoreError::InvalidParticipants(
            "a thread needs at least one other participant".to_string(),
        ));
    }
    if all.len() > MAX_PARTICIPANTS {
        return Err(StoreError::InvalidParticipants(format!(
            "at most {MAX_PARTICIPANTS} participants are allowed"
        )));
    }
    Ok(all)
}

/// Participant cursor column moved by a receipt of this status
pub(crate) fn cursor_column(status: ReceiptStatus) -> &'static str {
    match status {
        ReceiptStatus::Read => "last_read_message_id",
        ReceiptStatus::Sent | ReceiptStatus::Delivered => "last_delivered_message_id",
    }
}
