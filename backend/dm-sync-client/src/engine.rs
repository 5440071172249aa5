//! Per-conversation synchronization engine.
//!
//! One instance owns one thread's timeline, reorder buffer and outbox. Every
//! mutation goes through `&mut self`, so the owner (normally the session task)
//! serializes them. Network calls are the only suspension points.

use chrono::{DateTime, Utc};
use event_schema::broker::validate_body;
use event_schema::{ClientFrame, Cursor, PersistedMessage, PushEvent, ReceiptDto};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult, TransportError};
use crate::model::{MessageStatus, ThreadSnapshot};
use crate::outbox::{Outbox, OutboxStore};
use crate::reorder::ReorderBuffer;
use crate::timeline::{MergeOutcome, Timeline};
use crate::transport::{PushSender, SyncTransport};

/// Receipts fetched per refresh
const RECEIPT_REFRESH_LIMIT: usize = 200;

pub struct SyncEngine {
    config: SyncConfig,
    thread_id: Uuid,
    user_id: Uuid,
    transport: Arc<dyn SyncTransport>,
    timeline: Timeline,
    reorder: ReorderBuffer,
    outbox: Outbox,
    push: Option<PushSender>,
    online: bool,
    // Push sends waiting for ack or persisted event, by ack deadline
    in_flight: HashMap<Uuid, Instant>,
    has_older: bool,
    delivered_reported: Option<i64>,
    read_reported: Option<i64>,
    typing: HashSet<Uuid>,
    online_users: HashSet<Uuid>,
}

impl SyncEngine {
    /// Restore unsent messages from the outbox store. No network access.
    pub async fn open(
        config: SyncConfig,
        thread_id: Uuid,
        user_id: Uuid,
        transport: Arc<dyn SyncTransport>,
        outbox_store: Arc<dyn OutboxStore>,
    ) -> SyncResult<Self> {
        let outbox = Outbox::open(thread_id, outbox_store, config.outbox_backoff.clone()).await?;
        let mut timeline = Timeline::new(thread_id, user_id, config.heuristic_window);
        for item in outbox.items() {
            timeline.add_placeholder(item.client_msg_id, item.body.clone(), item.created_at);
        }
        if !outbox.is_empty() {
            info!(%thread_id, pending = outbox.len(), "restored unsent messages");
        }

        Ok(Self {
            reorder: ReorderBuffer::new(config.reorder_delay),
            config,
            thread_id,
            user_id,
            transport,
            timeline,
            outbox,
            push: None,
            online: true,
            in_flight: HashMap::new(),
            has_older: true,
            delivered_reported: None,
            read_reported: None,
            typing: HashSet::new(),
            online_users: HashSet::new(),
        })
    }

    pub fn thread_id(&self) -> Uuid {
        self.thread_id
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn is_push_connected(&self) -> bool {
        self.push.as_ref().is_some_and(|p| !p.is_closed())
    }

    /// Seed the timeline with the newest page
    pub async fn bootstrap(&mut self) -> SyncResult<usize> {
        let page = self
            .transport
            .fetch_latest(self.thread_id, self.config.page_size)
            .await?;
        self.has_older = page.has_more;
        let added = self.merge_page(page.messages.into_iter().map(Into::into)).await?;
        debug!(
            thread_id = %self.thread_id,
            added,
            watermark = ?self.timeline.newest_cursor(),
            "bootstrapped"
        );
        Ok(added)
    }

    /// Optimistic send. The placeholder is on the timeline before any network
    /// call; failures show up as its status, not as an error here.
    pub async fn send(&mut self, body: String) -> SyncResult<Uuid> {
        validate_body(&body, self.config.max_body_bytes)
            .map_err(|e| SyncError::InvalidBody(e.to_string()))?;
        let client_msg_id = Uuid::new_v4();
        self.timeline
            .add_placeholder(client_msg_id, body.clone(), Utc::now());
        self.dispatch(client_msg_id, body).await?;
        Ok(client_msg_id)
    }

    /// Retry a failed message now, with its original token
    pub async fn retry(&mut self, client_msg_id: Uuid) -> SyncResult<()> {
        let body = match self.timeline.find_by_token(client_msg_id) {
            None => return Err(SyncError::UnknownMessage(client_msg_id)),
            Some(m) if m.status != MessageStatus::Failed => {
                return Err(SyncError::NotRetryable(client_msg_id))
            }
            Some(m) => m.body.clone(),
        };
        self.timeline.mark_sending(client_msg_id);
        self.outbox.remove(client_msg_id).await?;
        self.dispatch(client_msg_id, body).await
    }

    async fn dispatch(&mut self, client_msg_id: Uuid, body: String) -> SyncResult<()> {
        if !self.online {
            debug!(%client_msg_id, "offline, queued in outbox");
            self.outbox
                .enqueue(client_msg_id, body, 0, Utc::now())
                .await?;
            return Ok(());
        }

        if let Some(push) = &self.push {
            let frame = ClientFrame::SendMessage {
                thread_id: self.thread_id,
                body: body.clone(),
                client_msg_id,
            };
            if push.send(frame).is_ok() {
                self.in_flight
                    .insert(client_msg_id, Instant::now() + self.config.ack_timeout);
                return Ok(());
            }
            self.push = None;
        }

        match self
            .transport
            .send_message(self.thread_id, client_msg_id, &body)
            .await
        {
            Ok(message) => {
                self.merge_persisted(message.into()).await?;
            }
            Err(e) => self.send_failed(client_msg_id, body, &e).await?,
        }
        Ok(())
    }

    async fn send_failed(
        &mut self,
        client_msg_id: Uuid,
        body: String,
        error: &TransportError,
    ) -> SyncResult<()> {
        self.timeline.mark_failed(client_msg_id);
        if error.is_transient() {
            warn!(%client_msg_id, error = %error, "send failed, queued for retry");
            self.outbox
                .enqueue(client_msg_id, body, 1, Utc::now())
                .await?;
        } else {
            warn!(%client_msg_id, error = %error, "send rejected");
            self.outbox.remove(client_msg_id).await?;
        }
        Ok(())
    }

    /// Single entry for durable messages from any source. Confirms own sends and
    /// drops their outbox items.
    async fn merge_persisted(&mut self, message: PersistedMessage) -> SyncResult<MergeOutcome> {
        let id = message.id;
        let outcome = self.timeline.apply_persisted(message);
        let own_token = self
            .timeline
            .get(id)
            .filter(|m| m.sender_id == self.user_id)
            .and_then(|m| m.client_msg_id);
        if let Some(token) = own_token {
            self.in_flight.remove(&token);
            self.outbox.remove(token).await?;
        }
        Ok(outcome)
    }

    async fn merge_page(
        &mut self,
        messages: impl Iterator<Item = PersistedMessage>,
    ) -> SyncResult<usize> {
        let mut added = 0;
        for message in messages {
            if matches!(
                self.merge_persisted(message).await?,
                MergeOutcome::Inserted | MergeOutcome::Reconciled
            ) {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Hold a push event in the reorder buffer, then merge whatever is due
    pub async fn handle_push(&mut self, event: PushEvent, now: Instant) -> SyncResult<()> {
        if event.thread_id() != self.thread_id {
            return Ok(());
        }
        self.reorder.push(event, now);
        self.flush_reorder(now).await
    }

    pub fn next_reorder_deadline(&self) -> Option<Instant> {
        self.reorder.next_deadline()
    }

    pub async fn flush_reorder(&mut self, now: Instant) -> SyncResult<()> {
        let mut incoming = false;
        for event in self.reorder.release(now) {
            incoming |= self.apply_event(event).await?;
        }
        if incoming {
            self.report_delivered().await;
        }
        Ok(())
    }

    /// Returns whether a new message from someone else arrived
    async fn apply_event(&mut self, event: PushEvent) -> SyncResult<bool> {
        match event {
            PushEvent::Ack {
                client_msg_id,
                sender_id,
                body,
                timestamp,
                ..
            } => {
                self.in_flight.remove(&client_msg_id);
                self.timeline
                    .apply_ack(client_msg_id, sender_id, body, timestamp);
            }
            PushEvent::Persisted(message) => {
                let from_peer = message.sender_id != self.user_id;
                let outcome = self.merge_persisted(message).await?;
                return Ok(from_peer && outcome != MergeOutcome::Unchanged);
            }
            PushEvent::Typing {
                user_id, typing, ..
            } if user_id != self.user_id => {
                if typing {
                    self.typing.insert(user_id);
                } else {
                    self.typing.remove(&user_id);
                }
            }
            PushEvent::Presence {
                user_id, online, ..
            } if user_id != self.user_id => {
                if online {
                    self.online_users.insert(user_id);
                } else {
                    self.online_users.remove(&user_id);
                    self.typing.remove(&user_id);
                }
            }
            PushEvent::Receipt {
                user_id,
                up_to_message_id,
                status,
                ..
            } => {
                self.timeline
                    .apply_receipt(user_id, up_to_message_id, status);
            }
            PushEvent::Rejected {
                client_msg_id: Some(client_msg_id),
                code,
                message,
                ..
            } => {
                self.in_flight.remove(&client_msg_id);
                if let Some(body) = self
                    .timeline
                    .find_by_token(client_msg_id)
                    .filter(|m| !m.is_persisted())
                    .map(|m| m.body.clone())
                {
                    let error = TransportError::Server {
                        status: 0,
                        code,
                        message,
                    };
                    self.send_failed(client_msg_id, body, &error).await?;
                }
            }
            PushEvent::Rejected { code, message, .. } => {
                warn!(thread_id = %self.thread_id, %code, %message, "push frame rejected");
            }
            PushEvent::Typing { .. } | PushEvent::Presence { .. } => {}
        }
        Ok(false)
    }

    /// Push channel is up: close the gap, flush the outbox, catch up on receipts
    pub async fn on_push_connected(&mut self, sender: PushSender) -> SyncResult<()> {
        self.push = Some(sender);
        self.online = true;
        self.catch_up().await
    }

    /// Push sends without an ack may or may not have reached the gateway; they
    /// move to the outbox and are resent with the same token.
    pub async fn on_push_disconnected(&mut self) -> SyncResult<()> {
        self.push = None;
        self.typing.clear();
        self.online_users.clear();
        self.park_in_flight().await
    }

    async fn park_in_flight(&mut self) -> SyncResult<()> {
        let now = Utc::now();
        let tokens: Vec<Uuid> = self.in_flight.drain().map(|(token, _)| token).collect();
        for token in tokens {
            let body = match self.timeline.find_by_token(token) {
                Some(m) if !m.is_persisted() => m.body.clone(),
                _ => continue,
            };
            self.outbox.enqueue(token, body, 0, now).await?;
        }
        Ok(())
    }

    /// Connectivity signal from the host
    pub async fn set_online(&mut self, online: bool) -> SyncResult<()> {
        let was_online = self.online;
        self.online = online;
        if online && !was_online {
            info!(thread_id = %self.thread_id, "back online");
            self.catch_up().await?;
        }
        Ok(())
    }

    async fn catch_up(&mut self) -> SyncResult<()> {
        if let Err(e) = self.backfill().await {
            warn!(thread_id = %self.thread_id, error = %e, "backfill failed");
        }
        let now = Utc::now();
        self.outbox.reset_schedule(now).await?;
        self.flush_outbox(now).await?;
        if let Err(e) = self.refresh_receipts().await {
            debug!(thread_id = %self.thread_id, error = %e, "receipt refresh failed");
        }
        self.report_delivered().await;
        Ok(())
    }

    /// Fetch everything strictly after the watermark. Without a watermark this
    /// is a bootstrap.
    pub async fn backfill(&mut self) -> SyncResult<usize> {
        let Some(mut cursor) = self.timeline.newest_cursor() else {
            return self.bootstrap().await;
        };
        let mut added = 0;
        loop {
            let page = self
                .transport
                .fetch_after(self.thread_id, cursor, self.config.page_size)
                .await?;
            let next = page.newest_cursor();
            let has_more = page.has_more;
            added += self.merge_page(page.messages.into_iter().map(Into::into)).await?;
            match next {
                Some(next) if has_more && next > cursor => cursor = next,
                _ => break,
            }
        }
        if added > 0 {
            info!(thread_id = %self.thread_id, added, "backfill closed gap");
        }
        Ok(added)
    }

    /// Retry every due outbox item; returns how many were confirmed
    pub async fn flush_outbox(&mut self, now: DateTime<Utc>) -> SyncResult<usize> {
        if !self.online {
            return Ok(0);
        }
        self.flush_due(now).await
    }

    /// Outbox flush for a closed conversation. Connectivity signals may no
    /// longer reach it, so due items are attempted regardless and failures
    /// back off on the item schedule. `reset` makes every item due now.
    pub async fn flush_closed(&mut self, now: DateTime<Utc>, reset: bool) -> SyncResult<usize> {
        if reset {
            self.outbox.reset_schedule(now).await?;
        }
        self.flush_due(now).await
    }

    async fn flush_due(&mut self, now: DateTime<Utc>) -> SyncResult<usize> {
        let mut confirmed = 0;
        for item in self.outbox.due(now) {
            self.timeline.mark_sending(item.client_msg_id);
            match self
                .transport
                .send_message(self.thread_id, item.client_msg_id, &item.body)
                .await
            {
                Ok(message) => {
                    self.merge_persisted(message.into()).await?;
                    confirmed += 1;
                }
                Err(e) if e.is_transient() => {
                    debug!(
                        client_msg_id = %item.client_msg_id,
                        attempts = item.attempts + 1,
                        error = %e,
                        "outbox retry failed"
                    );
                    self.timeline.mark_failed(item.client_msg_id);
                    self.outbox.record_failure(item.client_msg_id, now).await?;
                }
                Err(e) => {
                    warn!(client_msg_id = %item.client_msg_id, error = %e, "outbox item rejected");
                    self.timeline.mark_failed(item.client_msg_id);
                    self.outbox.remove(item.client_msg_id).await?;
                }
            }
        }
        Ok(confirmed)
    }

    pub fn next_ack_deadline(&self) -> Option<Instant> {
        self.in_flight.values().min().copied()
    }

    /// Push sends past their ack deadline are failed and queued for retry
    pub async fn check_ack_timeouts(&mut self, now: Instant) -> SyncResult<usize> {
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in &expired {
            self.in_flight.remove(token);
            let Some(body) = self
                .timeline
                .find_by_token(*token)
                .filter(|m| !m.is_persisted())
                .map(|m| m.body.clone())
            else {
                continue;
            };
            warn!(client_msg_id = %token, "no ack before timeout");
            self.send_failed(*token, body, &TransportError::Disconnected)
                .await?;
        }
        Ok(expired.len())
    }

    /// Prepend the page before the oldest loaded message
    pub async fn load_older(&mut self) -> SyncResult<usize> {
        match self.timeline.oldest_cursor() {
            Some(cursor) => self.load_older_than(cursor).await,
            None => self.bootstrap().await,
        }
    }

    pub async fn load_older_than(&mut self, cursor: Cursor) -> SyncResult<usize> {
        let page = self
            .transport
            .fetch_before(self.thread_id, cursor, self.config.page_size)
            .await?;
        self.has_older = page.has_more;
        self.merge_page(page.messages.into_iter().map(Into::into)).await
    }

    /// Advance the own read cursor to the newest incoming message
    pub async fn mark_read(&mut self) -> SyncResult<bool> {
        let Some(up_to) = self.timeline.newest_incoming_id() else {
            return Ok(false);
        };
        if self.read_reported.is_some_and(|r| r >= up_to) {
            return Ok(false);
        }
        self.transport.mark_read(self.thread_id, up_to).await?;
        self.read_reported = Some(up_to);
        self.delivered_reported = self.delivered_reported.max(Some(up_to));
        Ok(true)
    }

    /// Best effort; a failure is retried with the next incoming message
    async fn report_delivered(&mut self) {
        if !self.config.report_delivered || !self.online {
            return;
        }
        let Some(up_to) = self.timeline.newest_incoming_id() else {
            return;
        };
        if self.delivered_reported.is_some_and(|d| d >= up_to) {
            return;
        }

        let sent = match &self.push {
            Some(push) => push
                .send(ClientFrame::Delivered {
                    thread_id: self.thread_id,
                    up_to_message_id: up_to,
                })
                .is_ok(),
            None => match self.transport.mark_delivered(self.thread_id, up_to).await {
                Ok(_) => true,
                Err(e) => {
                    debug!(thread_id = %self.thread_id, error = %e, "delivered receipt failed");
                    false
                }
            },
        };
        if sent {
            self.delivered_reported = Some(up_to);
        }
    }

    /// Pull receipts for recent own messages, e.g. after a disconnect
    pub async fn refresh_receipts(&mut self) -> SyncResult<usize> {
        let ids = self.timeline.own_persisted_ids(RECEIPT_REFRESH_LIMIT);
        if ids.is_empty() {
            return Ok(0);
        }
        let receipts: Vec<ReceiptDto> = self.transport.fetch_receipts(self.thread_id, &ids).await?;
        Ok(receipts
            .into_iter()
            .map(|r| self.timeline.apply_receipt(r.user_id, r.message_id, r.status))
            .sum())
    }

    /// Best-effort typing indicator
    pub fn set_typing(&self, typing: bool) {
        if let Some(push) = &self.push {
            let _ = push.send(ClientFrame::Typing {
                thread_id: self.thread_id,
                typing,
            });
        }
    }

    pub fn snapshot(&self) -> ThreadSnapshot {
        let mut typing: Vec<Uuid> = self.typing.iter().copied().collect();
        typing.sort();
        let mut online: Vec<Uuid> = self.online_users.iter().copied().collect();
        online.sort();
        ThreadSnapshot {
            thread_id: self.thread_id,
            messages: self.timeline.messages(),
            typing,
            online,
            pending_outbox: self.outbox.len(),
            connected: self.is_push_connected(),
            has_older: self.has_older,
        }
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    /// Cancel buffered events and detach from the push channel. Unconfirmed push
    /// sends are parked in the outbox, which the owner keeps flushing with
    /// [`SyncEngine::flush_closed`].
    pub async fn close(&mut self) -> SyncResult<()> {
        self.reorder.clear();
        self.push = None;
        self.typing.clear();
        self.online_users.clear();
        self.park_in_flight().await?;
        info!(thread_id = %self.thread_id, pending = self.outbox.len(), "conversation closed");
        Ok(())
    }
}
