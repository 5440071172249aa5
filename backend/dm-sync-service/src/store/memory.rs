use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use event_schema::cursor::storage_precision;
use event_schema::{
    Cursor, MessageDto, MessagePage, ReceiptAdvance, ReceiptDto, ReceiptStatus, UnreadCount,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{normalize_participants, MessageStore, StoreError, StoreResult};
use crate::models::{direct_key, DeadLetter, InsertOutcome, NewMessage, PageQuery, Thread};

#[derive(Debug, Default, Clone, Copy)]
struct ParticipantCursor {
    last_read: Option<i64>,
    last_delivered: Option<i64>,
}

#[derive(Default)]
struct Inner {
    threads: HashMap<Uuid, Thread>,
    direct: HashMap<String, Uuid>,
    messages: BTreeMap<i64, MessageDto>,
    tokens: HashMap<(Uuid, Uuid), i64>,
    receipts: BTreeMap<(i64, Uuid), (ReceiptStatus, DateTime<Utc>)>,
    cursors: HashMap<(Uuid, Uuid), ParticipantCursor>,
    dead_letters: Vec<DeadLetter>,
    next_id: i64,
    last_created_at: Option<DateTime<Utc>>,
}

impl Inner {
    /// Strictly increasing at storage precision, like `clock_timestamp()` on one node
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let mut now = storage_precision(Utc::now());
        if let Some(last) = self.last_created_at {
            if now <= last {
                now = last + Duration::microseconds(1);
            }
        }
        self.last_created_at = Some(now);
        now
    }

    fn thread(&self, thread_id: Uuid) -> StoreResult<&Thread> {
        self.threads.get(&thread_id).ok_or(StoreError::ThreadNotFound)
    }

    fn thread_messages(&self, thread_id: Uuid) -> Vec<&MessageDto> {
        let mut rows: Vec<&MessageDto> = self
            .messages
            .values()
            .filter(|m| m.thread_id == thread_id)
            .collect();
        rows.sort_by_key(|m| m.cursor());
        rows
    }
}

/// In-process store with the same constraints as Postgres. Used by tests and
/// local runs without a database.
pub struct MemoryMessageStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// The first stored message gets `next_id`
    pub fn starting_at(next_id: i64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id,
                ..Inner::default()
            }),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every call fails with a transient error
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().await.dead_letters.clone()
    }

    pub async fn message_count(&self, thread_id: Uuid) -> usize {
        self.inner
            .lock()
            .await
            .messages
            .values()
            .filter(|m| m.thread_id == thread_id)
            .count()
    }

    pub async fn receipt(&self, message_id: i64, user_id: Uuid) -> Option<ReceiptStatus> {
        self.inner
            .lock()
            .await
            .receipts
            .get(&(message_id, user_id))
            .map(|(status, _)| *status)
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create_thread(&self, creator: Uuid, others: &[Uuid]) -> StoreResult<Thread> {
        self.check()?;
        let participant_ids = normalize_participants(creator, others)?;
        let mut inner = self.inner.lock().await;

        let key = direct_key(&participant_ids);
        if let Some(existing) = key.as_ref().and_then(|k| inner.direct.get(k)) {
            let id = *existing;
            return inner.thread(id).cloned();
        }

        let thread = Thread {
            id: Uuid::new_v4(),
            participant_ids,
            created_by: creator,
            created_at: storage_precision(Utc::now()),
            archived_at: None,
            last_message: None,
        };
        for user in &thread.participant_ids {
            inner
                .cursors
                .insert((thread.id, *user), ParticipantCursor::default());
        }
        if let Some(key) = key {
            inner.direct.insert(key, thread.id);
        }
        inner.threads.insert(thread.id, thread.clone());
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: Uuid) -> StoreResult<Thread> {
        self.check()?;
        self.inner.lock().await.thread(thread_id).cloned()
    }

    async fn archive_thread(&self, thread_id: Uuid) -> StoreResult<Thread> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let thread = inner
            .threads
            .get_mut(&thread_id)
            .ok_or(StoreError::ThreadNotFound)?;
        if thread.archived_at.is_none() {
            thread.archived_at = Some(storage_precision(Utc::now()));
        }
        Ok(thread.clone())
    }

    async fn insert_message(&self, message: &NewMessage) -> StoreResult<InsertOutcome> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let recipients: Vec<Uuid> = inner
            .thread(message.thread_id)?
            .participant_ids
            .iter()
            .copied()
            .filter(|u| *u != message.sender_id)
            .collect();

        if let Some(id) = inner
            .tokens
            .get(&(message.thread_id, message.client_msg_id))
            .copied()
        {
            let existing = inner.messages.get(&id).cloned().ok_or_else(|| {
                StoreError::Unavailable(format!("token index points at missing row {id}"))
            })?;
            return Ok(InsertOutcome {
                message: existing,
                created: false,
            });
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let created_at = inner.next_timestamp();
        let stored = MessageDto {
            id,
            thread_id: message.thread_id,
            sender_id: message.sender_id,
            client_msg_id: message.client_msg_id,
            body: message.body.clone(),
            created_at,
        };

        inner.messages.insert(id, stored.clone());
        inner
            .tokens
            .insert((message.thread_id, message.client_msg_id), id);
        for user in recipients {
            inner
                .receipts
                .insert((id, user), (ReceiptStatus::Sent, created_at));
        }
        if let Some(thread) = inner.threads.get_mut(&message.thread_id) {
            let cursor = stored.cursor();
            if thread.last_message.map_or(true, |last| last < cursor) {
                thread.last_message = Some(cursor);
            }
        }

        Ok(InsertOutcome {
            message: stored,
            created: true,
        })
    }

    async fn list_messages(&self, thread_id: Uuid, query: PageQuery) -> StoreResult<MessagePage> {
        self.check()?;
        let inner = self.inner.lock().await;
        inner.thread(thread_id)?;
        let rows = inner.thread_messages(thread_id);
        let limit = query.limit().max(0) as usize;

        let (mut messages, has_more): (Vec<MessageDto>, bool) = match query {
            PageQuery::Latest { .. } => take_newest(rows.into_iter(), limit),
            PageQuery::Before { cursor, .. } => {
                take_newest(rows.into_iter().filter(|m| m.cursor() < cursor), limit)
            }
            PageQuery::After { cursor, .. } => {
                let newer: Vec<MessageDto> = rows
                    .into_iter()
                    .filter(|m| m.cursor() > cursor)
                    .cloned()
                    .collect();
                let has_more = newer.len() > limit;
                (newer.into_iter().take(limit).collect(), has_more)
            }
        };
        messages.sort_by_key(MessageDto::cursor);
        Ok(MessagePage { messages, has_more })
    }

    async fn advance_receipts(
        &self,
        thread_id: Uuid,
        user_id: Uuid,
        up_to_message_id: i64,
        status: ReceiptStatus,
    ) -> StoreResult<ReceiptAdvance> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        inner.thread(thread_id)?;
        let target: Cursor = inner
            .messages
            .get(&up_to_message_id)
            .filter(|m| m.thread_id == thread_id)
            .map(MessageDto::cursor)
            .ok_or(StoreError::MessageNotInThread(up_to_message_id))?;

        let mut cursor_advanced = false;
        if let Some(cursor) = inner.cursors.get_mut(&(thread_id, user_id)) {
            let slot = match status {
                ReceiptStatus::Read => &mut cursor.last_read,
                ReceiptStatus::Sent | ReceiptStatus::Delivered => &mut cursor.last_delivered,
            };
            if slot.map_or(true, |current| current < up_to_message_id) {
                *slot = Some(up_to_message_id);
                cursor_advanced = true;
            }
        }

        let received: Vec<i64> = inner
            .thread_messages(thread_id)
            .into_iter()
            .filter(|m| m.sender_id != user_id && m.cursor() <= target)
            .map(|m| m.id)
            .collect();

        let now = Utc::now();
        let mut receipts_updated = 0u64;
        for message_id in received {
            let entry = inner.receipts.get(&(message_id, user_id)).copied();
            if entry.map_or(true, |(current, _)| current < status) {
                inner.receipts.insert((message_id, user_id), (status, now));
                receipts_updated += 1;
            }
        }

        Ok(ReceiptAdvance {
            thread_id,
            user_id,
            up_to_message_id,
            status,
            cursor_advanced,
            receipts_updated,
        })
    }

    async fn receipts_for(
        &self,
        thread_id: Uuid,
        caller: Uuid,
        message_ids: &[i64],
    ) -> StoreResult<Vec<ReceiptDto>> {
        self.check()?;
        let inner = self.inner.lock().await;
        let mut out = Vec::new();
        for message_id in message_ids {
            let Some(message) = inner.messages.get(message_id) else {
                continue;
            };
            if message.thread_id != thread_id || message.sender_id != caller {
                continue;
            }
            out.extend(
                inner
                    .receipts
                    .range((*message_id, Uuid::nil())..)
                    .take_while(|((id, _), _)| id == message_id)
                    .filter(|((_, user), _)| *user != caller)
                    .map(|((id, user), (status, updated_at))| ReceiptDto {
                        message_id: *id,
                        user_id: *user,
                        status: *status,
                        updated_at: *updated_at,
                    }),
            );
        }
        out.sort_by_key(|r| (r.message_id, r.user_id));
        out.dedup_by_key(|r| (r.message_id, r.user_id));
        Ok(out)
    }

    async fn unread_count(&self, thread_id: Uuid, user_id: Uuid) -> StoreResult<UnreadCount> {
        self.check()?;
        let inner = self.inner.lock().await;
        inner.thread(thread_id)?;
        let last_read = inner
            .cursors
            .get(&(thread_id, user_id))
            .and_then(|c| c.last_read);
        let unread = inner
            .messages
            .values()
            .filter(|m| {
                m.thread_id == thread_id
                    && m.sender_id != user_id
                    && last_read.map_or(true, |read| m.id > read)
            })
            .count() as i64;

        Ok(UnreadCount {
            thread_id,
            unread,
            last_read_message_id: last_read,
        })
    }

    async fn record_dead_letter(
        &self,
        entry_id: &str,
        reason: &str,
        payload: &serde_json::Value,
    ) -> StoreResult<()> {
        self.check()?;
        self.inner.lock().await.dead_letters.push(DeadLetter {
            entry_id: entry_id.to_string(),
            reason: reason.to_string(),
            payload: payload.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }
}

/// Newest `limit` rows of an ascending iterator, plus whether older rows remain
fn take_newest<'a>(
    rows: impl Iterator<Item = &'a MessageDto>,
    limit: usize,
) -> (Vec<MessageDto>, bool) {
    let all: Vec<&MessageDto> = rows.collect();
    let skip = all.len().saturating_sub(limit);
    (all[skip..].iter().map(|m| (*m).clone()).collect(), skip > 0)
}
