use chrono::{DateTime, Utc};
use event_schema::{Cursor, MessageDto, ThreadDto};
use uuid::Uuid;

/// Smallest and largest participant set a thread accepts
pub const MIN_PARTICIPANTS: usize = 2;
pub const MAX_PARTICIPANTS: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct Thread {
    pub id: Uuid,
    /// Sorted, deduplicated
    pub participant_ids: Vec<Uuid>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
    pub last_message: Option<Cursor>,
}

impl Thread {
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participant_ids.binary_search(&user_id).is_ok()
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn to_dto(&self) -> ThreadDto {
        ThreadDto {
            id: self.id,
            participant_ids: self.participant_ids.clone(),
            created_at: self.created_at,
            archived_at: self.archived_at,
            last_message: self.last_message,
        }
    }
}

/// Canonical key of a 1:1 thread, independent of who created it
pub fn direct_key(participants: &[Uuid]) -> Option<String> {
    match participants {
        [a, b] => {
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            Some(format!("{lo}:{hi}"))
        }
        _ => None,
    }
}

/// A validated send on its way into storage
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub thread_id: Uuid,
    pub sender_id: Uuid,
    pub client_msg_id: Uuid,
    pub body: String,
}

/// Result of an idempotent insert
#[derive(Debug, Clone)]
pub struct InsertOutcome {
    pub message: MessageDto,
    /// False when the (thread, client_msg_id) row already existed
    pub created: bool,
}

/// Which slice of a thread's history to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageQuery {
    Latest { limit: i64 },
    Before { cursor: Cursor, limit: i64 },
    After { cursor: Cursor, limit: i64 },
}

impl PageQuery {
    pub fn limit(&self) -> i64 {
        match self {
            PageQuery::Latest { limit }
            | PageQuery::Before { limit, .. }
            | PageQuery::After { limit, .. } => *limit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub entry_id: String,
    pub reason: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_key_ignores_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(direct_key(&[a, b]), direct_key(&[b, a]));
        assert!(direct_key(&[a, b, Uuid::new_v4()]).is_none());
    }
}
