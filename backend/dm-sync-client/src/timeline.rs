//! Merge and dedup of one thread's messages.
//!
//! Persisted messages are keyed by server id; entries without a server id yet
//! (own placeholders, acks seen before persistence) live in a pending list in the
//! order they appeared. All three inputs go through the same merge: optimistic
//! sends, push events and history pages.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use event_schema::{Cursor, PersistedMessage, ReceiptStatus};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::model::{LocalMessage, MessageStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A message not seen before was added
    Inserted,
    /// A pending entry was matched and now carries its server id
    Reconciled,
    /// An existing entry changed in place
    Updated,
    Unchanged,
}

pub struct Timeline {
    thread_id: Uuid,
    self_id: Uuid,
    heuristic_window: ChronoDuration,
    persisted: HashMap<i64, LocalMessage>,
    by_token: HashMap<Uuid, i64>,
    pending: Vec<LocalMessage>,
    // Furthest receipts reported by any other participant
    delivered_up_to: Option<i64>,
    read_up_to: Option<i64>,
}

impl Timeline {
    pub fn new(thread_id: Uuid, self_id: Uuid, heuristic_window: Duration) -> Self {
        Self {
            thread_id,
            self_id,
            heuristic_window: ChronoDuration::from_std(heuristic_window)
                .unwrap_or_else(|_| ChronoDuration::seconds(5)),
            persisted: HashMap::new(),
            by_token: HashMap::new(),
            pending: Vec::new(),
            delivered_up_to: None,
            read_up_to: None,
        }
    }

    pub fn thread_id(&self) -> Uuid {
        self.thread_id
    }

    /// Optimistic entry for an own send. A token already on the timeline is
    /// left as is.
    pub fn add_placeholder(
        &mut self,
        client_msg_id: Uuid,
        body: String,
        now: DateTime<Utc>,
    ) -> LocalMessage {
        if let Some(existing) = self.find_by_token(client_msg_id) {
            return existing.clone();
        }
        let message = LocalMessage {
            local_id: Uuid::new_v4(),
            client_msg_id: Some(client_msg_id),
            server_id: None,
            thread_id: self.thread_id,
            sender_id: self.self_id,
            body,
            created_at: now,
            status: MessageStatus::Sending,
        };
        self.pending.push(message.clone());
        message
    }

    pub fn find_by_token(&self, client_msg_id: Uuid) -> Option<&LocalMessage> {
        if let Some(id) = self.by_token.get(&client_msg_id) {
            return self.persisted.get(id);
        }
        self.pending
            .iter()
            .find(|m| m.client_msg_id == Some(client_msg_id))
    }

    fn pending_mut(&mut self, client_msg_id: Uuid) -> Option<&mut LocalMessage> {
        self.pending
            .iter_mut()
            .find(|m| m.client_msg_id == Some(client_msg_id))
    }

    /// `Sending -> Failed`. Any other state is left alone.
    pub fn mark_failed(&mut self, client_msg_id: Uuid) -> bool {
        match self.pending_mut(client_msg_id) {
            Some(m) if m.status == MessageStatus::Sending => {
                m.status = MessageStatus::Failed;
                true
            }
            _ => false,
        }
    }

    /// `Failed -> Sending` for a retry
    pub fn mark_sending(&mut self, client_msg_id: Uuid) -> bool {
        match self.pending_mut(client_msg_id) {
            Some(m) if m.status == MessageStatus::Failed => {
                m.status = MessageStatus::Sending;
                true
            }
            _ => false,
        }
    }

    /// Fast acknowledgment from the gateway. Confirms an own placeholder, or shows
    /// a peer's message before it is durable.
    pub fn apply_ack(
        &mut self,
        client_msg_id: Uuid,
        sender_id: Option<Uuid>,
        body: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> MergeOutcome {
        if self.by_token.contains_key(&client_msg_id) {
            return MergeOutcome::Unchanged;
        }
        if let Some(m) = self.pending_mut(client_msg_id) {
            let next = m.status.advance_to(MessageStatus::Sent);
            if next == m.status {
                return MergeOutcome::Unchanged;
            }
            m.status = next;
            return MergeOutcome::Updated;
        }

        match (sender_id, body) {
            (Some(sender_id), Some(body)) => {
                self.pending.push(LocalMessage {
                    local_id: Uuid::new_v4(),
                    client_msg_id: Some(client_msg_id),
                    server_id: None,
                    thread_id: self.thread_id,
                    sender_id,
                    body,
                    created_at: timestamp,
                    status: MessageStatus::Sent,
                });
                MergeOutcome::Inserted
            }
            _ => MergeOutcome::Unchanged,
        }
    }

    /// Merge a durable message. Matching order: server id, then idempotency token,
    /// then (only for events without a token) the sender/body/time heuristic
    /// against own unconfirmed placeholders. No match appends a new entry.
    pub fn apply_persisted(&mut self, msg: PersistedMessage) -> MergeOutcome {
        if msg.thread_id != self.thread_id {
            return MergeOutcome::Unchanged;
        }

        if let Some(existing) = self.persisted.get_mut(&msg.id) {
            let mut changed = false;
            if existing.body != msg.body || existing.created_at != msg.created_at {
                existing.body = msg.body;
                existing.created_at = msg.created_at;
                changed = true;
            }
            if existing.client_msg_id.is_none() {
                if let Some(token) = msg.client_msg_id {
                    existing.client_msg_id = Some(token);
                    self.by_token.insert(token, msg.id);
                    changed = true;
                }
            }
            return if changed {
                MergeOutcome::Updated
            } else {
                MergeOutcome::Unchanged
            };
        }

        let matched = match msg.client_msg_id {
            Some(token) => self
                .pending
                .iter()
                .position(|p| p.client_msg_id == Some(token)),
            None => self.heuristic_match(&msg),
        };

        let (outcome, local_id, token, status) = match matched {
            Some(index) => {
                let placeholder = self.pending.remove(index);
                (
                    MergeOutcome::Reconciled,
                    placeholder.local_id,
                    msg.client_msg_id.or(placeholder.client_msg_id),
                    placeholder.status.advance_to(MessageStatus::Sent),
                )
            }
            None => (
                MergeOutcome::Inserted,
                Uuid::new_v4(),
                msg.client_msg_id,
                MessageStatus::Sent,
            ),
        };

        let status = if msg.sender_id == self.self_id {
            status.advance_to(self.receipt_floor(msg.id))
        } else {
            status
        };

        if let Some(token) = token {
            self.by_token.insert(token, msg.id);
        }
        self.persisted.insert(
            msg.id,
            LocalMessage {
                local_id,
                client_msg_id: token,
                server_id: Some(msg.id),
                thread_id: msg.thread_id,
                sender_id: msg.sender_id,
                body: msg.body,
                created_at: msg.created_at,
                status,
            },
        );
        outcome
    }

    fn heuristic_match(&self, msg: &PersistedMessage) -> Option<usize> {
        if msg.sender_id != self.self_id {
            return None;
        }
        self.pending.iter().position(|p| {
            p.sender_id == msg.sender_id
                && !p.status.is_confirmed()
                && p.body == msg.body
                && (p.created_at - msg.created_at).abs() <= self.heuristic_window
        })
    }

    fn receipt_floor(&self, id: i64) -> MessageStatus {
        if self.read_up_to.is_some_and(|up_to| id <= up_to) {
            MessageStatus::Read
        } else if self.delivered_up_to.is_some_and(|up_to| id <= up_to) {
            MessageStatus::Delivered
        } else {
            MessageStatus::Sent
        }
    }

    /// A peer advanced their receipts. Own messages up to `up_to_message_id` move
    /// forward; nothing ever moves back. Returns how many entries changed.
    pub fn apply_receipt(
        &mut self,
        user_id: Uuid,
        up_to_message_id: i64,
        status: ReceiptStatus,
    ) -> usize {
        if user_id == self.self_id {
            return 0;
        }
        if status >= ReceiptStatus::Delivered {
            self.delivered_up_to = self.delivered_up_to.max(Some(up_to_message_id));
        }
        if status == ReceiptStatus::Read {
            self.read_up_to = self.read_up_to.max(Some(up_to_message_id));
        }

        let target = MessageStatus::from(status);
        let mut changed = 0;
        for m in self.persisted.values_mut() {
            let covered = m.server_id.is_some_and(|id| id <= up_to_message_id);
            if m.sender_id != self.self_id || !covered {
                continue;
            }
            let next = m.status.advance_to(target);
            if next != m.status {
                m.status = next;
                changed += 1;
            }
        }
        changed
    }

    pub fn get(&self, server_id: i64) -> Option<&LocalMessage> {
        self.persisted.get(&server_id)
    }

    /// Server ids of the newest `limit` own persisted messages
    pub fn own_persisted_ids(&self, limit: usize) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .persisted
            .values()
            .filter(|m| m.sender_id == self.self_id)
            .filter_map(|m| m.server_id)
            .collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.truncate(limit);
        ids
    }

    /// Persisted entries in cursor order, then pending entries in arrival order
    pub fn messages(&self) -> Vec<LocalMessage> {
        let mut persisted: Vec<&LocalMessage> = self.persisted.values().collect();
        persisted.sort_by_key(|m| m.cursor());
        persisted
            .into_iter()
            .chain(self.pending.iter())
            .cloned()
            .collect()
    }

    /// Synchronization watermark
    pub fn newest_cursor(&self) -> Option<Cursor> {
        self.persisted.values().filter_map(LocalMessage::cursor).max()
    }

    pub fn oldest_cursor(&self) -> Option<Cursor> {
        self.persisted.values().filter_map(LocalMessage::cursor).min()
    }

    /// Newest persisted message written by someone else
    pub fn newest_incoming_id(&self) -> Option<i64> {
        self.persisted
            .values()
            .filter(|m| m.sender_id != self.self_id)
            .filter_map(|m| m.server_id)
            .max()
    }

    pub fn len(&self) -> usize {
        self.persisted.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn persisted(
        thread: Uuid,
        id: i64,
        sender: Uuid,
        token: Option<Uuid>,
        body: &str,
        secs: i64,
    ) -> PersistedMessage {
        PersistedMessage {
            thread_id: thread,
            client_msg_id: token,
            id,
            created_at: at(secs),
            sender_id: sender,
            body: body.to_string(),
        }
    }

    fn setup() -> (Timeline, Uuid, Uuid) {
        let me = Uuid::new_v4();
        let thread = Uuid::new_v4();
        (Timeline::new(thread, me, Duration::from_secs(5)), thread, me)
    }

    #[test]
    fn test_token_match_reconciles_placeholder_in_place() {
        let (mut tl, thread, me) = setup();
        let token = Uuid::new_v4();
        let placeholder = tl.add_placeholder(token, "hi".into(), at(0));

        let outcome = tl.apply_persisted(persisted(thread, 42, me, Some(token), "hi", 1));
        assert_eq!(outcome, MergeOutcome::Reconciled);

        let messages = tl.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].local_id, placeholder.local_id);
        assert_eq!(messages[0].server_id, Some(42));
        assert_eq!(messages[0].status, MessageStatus::Sent);
    }

    #[test]
    fn test_duplicate_persisted_events_are_idempotent() {
        let (mut tl, thread, me) = setup();
        let token = Uuid::new_v4();
        tl.add_placeholder(token, "hi".into(), at(0));
        tl.apply_persisted(persisted(thread, 42, me, Some(token), "hi", 1));
        assert_eq!(
            tl.apply_persisted(persisted(thread, 42, me, Some(token), "hi", 1)),
            MergeOutcome::Unchanged
        );
        assert_eq!(
            tl.apply_ack(token, Some(me), Some("hi".into()), at(0)),
            MergeOutcome::Unchanged
        );
        assert_eq!(tl.len(), 1);
    }

    #[test]
    fn test_heuristic_only_for_tokenless_events() {
        let (mut tl, thread, me) = setup();
        tl.add_placeholder(Uuid::new_v4(), "same body".into(), at(0));

        // Carries a different token: never matched by body
        let other = tl.apply_persisted(persisted(
            thread,
            7,
            me,
            Some(Uuid::new_v4()),
            "same body",
            1,
        ));
        assert_eq!(other, MergeOutcome::Inserted);
        assert_eq!(tl.len(), 2);

        // No token, within the window: matched
        let matched = tl.apply_persisted(persisted(thread, 8, me, None, "same body", 2));
        assert_eq!(matched, MergeOutcome::Reconciled);
        assert_eq!(tl.len(), 2);
    }

    #[test]
    fn test_heuristic_respects_window_and_sender() {
        let (mut tl, thread, me) = setup();
        let peer = Uuid::new_v4();
        tl.add_placeholder(Uuid::new_v4(), "ok".into(), at(0));

        assert_eq!(
            tl.apply_persisted(persisted(thread, 1, peer, None, "ok", 1)),
            MergeOutcome::Inserted
        );
        assert_eq!(
            tl.apply_persisted(persisted(thread, 2, me, None, "ok", 60)),
            MergeOutcome::Inserted
        );
        assert_eq!(tl.len(), 3);
    }

    #[test]
    fn test_peer_ack_then_persisted_shows_one_message() {
        let (mut tl, thread, _me) = setup();
        let peer = Uuid::new_v4();
        let token = Uuid::new_v4();

        assert_eq!(
            tl.apply_ack(token, Some(peer), Some("hi".into()), at(0)),
            MergeOutcome::Inserted
        );
        assert_eq!(
            tl.apply_persisted(persisted(thread, 42, peer, Some(token), "hi", 0)),
            MergeOutcome::Reconciled
        );
        let messages = tl.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].server_id, Some(42));
    }

    #[test]
    fn test_render_order_is_cursor_order() {
        let (mut tl, thread, _me) = setup();
        let peer = Uuid::new_v4();
        for (id, secs) in [(5, 30), (2, 10), (4, 20), (3, 20), (1, 5)] {
            tl.apply_persisted(persisted(thread, id, peer, None, "m", secs));
        }
        tl.add_placeholder(Uuid::new_v4(), "pending".into(), at(0));

        let ids: Vec<Option<i64>> = tl.messages().iter().map(|m| m.server_id).collect();
        assert_eq!(ids, vec![Some(1), Some(2), Some(3), Some(4), Some(5), None]);
        assert_eq!(tl.newest_cursor().map(|c| c.id), Some(5));
        assert_eq!(tl.oldest_cursor().map(|c| c.id), Some(1));
    }

    #[test]
    fn test_receipts_in_any_order_never_regress() {
        let (mut tl, thread, me) = setup();
        let peer = Uuid::new_v4();
        tl.apply_persisted(persisted(thread, 10, me, Some(Uuid::new_v4()), "a", 0));
        tl.apply_persisted(persisted(thread, 11, me, Some(Uuid::new_v4()), "b", 1));

        assert_eq!(tl.apply_receipt(peer, 11, ReceiptStatus::Read), 2);
        assert_eq!(tl.apply_receipt(peer, 11, ReceiptStatus::Delivered), 0);
        assert!(tl
            .messages()
            .iter()
            .all(|m| m.status == MessageStatus::Read));

        // Own receipts never change own message status
        assert_eq!(tl.apply_receipt(me, 11, ReceiptStatus::Read), 0);
    }

    #[test]
    fn test_receipt_before_persisted_event_is_remembered() {
        let (mut tl, thread, me) = setup();
        let peer = Uuid::new_v4();
        tl.apply_receipt(peer, 20, ReceiptStatus::Delivered);
        tl.apply_persisted(persisted(thread, 20, me, Some(Uuid::new_v4()), "late", 0));
        assert_eq!(tl.messages()[0].status, MessageStatus::Delivered);
    }

    #[test]
    fn test_failed_and_retry_transitions() {
        let (mut tl, _thread, _me) = setup();
        let token = Uuid::new_v4();
        tl.add_placeholder(token, "x".into(), at(0));

        assert!(!tl.mark_sending(token));
        assert!(tl.mark_failed(token));
        assert!(!tl.mark_failed(token));
        assert_eq!(tl.find_by_token(token).map(|m| m.status), Some(MessageStatus::Failed));
        assert!(tl.mark_sending(token));
        assert_eq!(tl.find_by_token(token).map(|m| m.status), Some(MessageStatus::Sending));

        // An ack confirms even a failed placeholder
        tl.mark_failed(token);
        assert_eq!(tl.apply_ack(token, None, None, at(1)), MergeOutcome::Updated);
        assert_eq!(tl.find_by_token(token).map(|m| m.status), Some(MessageStatus::Sent));
    }

    #[test]
    fn test_other_thread_events_are_ignored() {
        let (mut tl, _thread, me) = setup();
        let outcome = tl.apply_persisted(persisted(Uuid::new_v4(), 1, me, None, "x", 0));
        assert_eq!(outcome, MergeOutcome::Unchanged);
        assert!(tl.is_empty());
    }
}
