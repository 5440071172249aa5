// Engine behavior against an in-memory service
//
// Covers:
// 1. Optimistic send confirmed over REST
// 2. Offline send queued, then flushed with the same token on reconnect
// 3. Transient vs permanent send failures
// 4. Gap closure and older-page loading
// 5. Push sends: ack, persisted reconciliation, ack timeout
// 6. Receipts and read cursor reporting
// 7. Outbox restore across engine instances

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use dm_sync_client::transport::{PushSender, SyncTransport};
use dm_sync_client::{
    MemoryOutboxStore, MessageStatus, SyncConfig, SyncEngine, SyncError, TransportError,
};
use event_schema::{
    ClientFrame, Cursor, MessageDto, MessagePage, PersistedMessage, PushEvent, ReceiptAdvance,
    ReceiptDto, ReceiptStatus,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Default)]
struct FakeState {
    messages: Vec<MessageDto>,
    next_id: i64,
    unreachable: bool,
    reject_code: Option<String>,
    send_calls: usize,
    read_marks: Vec<i64>,
    delivered_marks: Vec<i64>,
    receipts: Vec<ReceiptDto>,
}

/// Single-thread service double with the same paging and idempotency rules
#[derive(Clone, Default)]
struct FakeService {
    state: Arc<Mutex<FakeState>>,
}

fn base_time() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

impl FakeService {
    fn insert(
        &self,
        thread_id: Uuid,
        sender_id: Uuid,
        client_msg_id: Uuid,
        body: &str,
    ) -> MessageDto {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state
            .messages
            .iter()
            .find(|m| m.thread_id == thread_id && m.client_msg_id == client_msg_id)
        {
            return existing.clone();
        }
        state.next_id += 1;
        let id = state.next_id;
        let message = MessageDto {
            id,
            thread_id,
            sender_id,
            client_msg_id,
            body: body.to_string(),
            created_at: base_time() + ChronoDuration::seconds(id),
        };
        state.messages.push(message.clone());
        message
    }

    fn seed(&self, thread_id: Uuid, sender_id: Uuid, count: usize) {
        for n in 0..count {
            self.insert(thread_id, sender_id, Uuid::new_v4(), &format!("msg {n}"));
        }
    }

    fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    fn stored(&self) -> Vec<MessageDto> {
        self.state.lock().unwrap().messages.clone()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    fn check_reachable(&self) -> Result<(), TransportError> {
        if self.state.lock().unwrap().unreachable {
            return Err(TransportError::Network("connection refused".into()));
        }
        Ok(())
    }

    fn sorted(&self, thread_id: Uuid) -> Vec<MessageDto> {
        let mut messages: Vec<MessageDto> = self
            .stored()
            .into_iter()
            .filter(|m| m.thread_id == thread_id)
            .collect();
        messages.sort_by_key(|m| m.cursor());
        messages
    }
}

fn newest_page(mut messages: Vec<MessageDto>, limit: usize) -> MessagePage {
    let has_more = messages.len() > limit;
    let split = messages.len().saturating_sub(limit);
    MessagePage {
        messages: messages.split_off(split),
        has_more,
    }
}

#[async_trait]
impl SyncTransport for FakeService {
    async fn fetch_latest(
        &self,
        thread_id: Uuid,
        limit: i64,
    ) -> Result<MessagePage, TransportError> {
        self.check_reachable()?;
        Ok(newest_page(self.sorted(thread_id), limit as usize))
    }

    async fn fetch_before(
        &self,
        thread_id: Uuid,
        cursor: Cursor,
        limit: i64,
    ) -> Result<MessagePage, TransportError> {
        self.check_reachable()?;
        let older: Vec<MessageDto> = self
            .sorted(thread_id)
            .into_iter()
            .filter(|m| m.cursor() < cursor)
            .collect();
        Ok(newest_page(older, limit as usize))
    }

    async fn fetch_after(
        &self,
        thread_id: Uuid,
        cursor: Cursor,
        limit: i64,
    ) -> Result<MessagePage, TransportError> {
        self.check_reachable()?;
        let mut newer: Vec<MessageDto> = self
            .sorted(thread_id)
            .into_iter()
            .filter(|m| m.cursor() > cursor)
            .collect();
        let has_more = newer.len() > limit as usize;
        newer.truncate(limit as usize);
        Ok(MessagePage {
            messages: newer,
            has_more,
        })
    }

    async fn send_message(
        &self,
        thread_id: Uuid,
        client_msg_id: Uuid,
        body: &str,
    ) -> Result<MessageDto, TransportError> {
        self.with_state(|s| s.send_calls += 1);
        self.check_reachable()?;
        if let Some(code) = self.with_state(|s| s.reject_code.clone()) {
            return Err(TransportError::Server {
                status: 403,
                code,
                message: "rejected".into(),
            });
        }
        Ok(self.insert(thread_id, ME, client_msg_id, body))
    }

    async fn mark_read(
        &self,
        thread_id: Uuid,
        up_to_message_id: i64,
    ) -> Result<ReceiptAdvance, TransportError> {
        self.check_reachable()?;
        self.with_state(|s| s.read_marks.push(up_to_message_id));
        Ok(advance(thread_id, up_to_message_id, ReceiptStatus::Read))
    }

    async fn mark_delivered(
        &self,
        thread_id: Uuid,
        up_to_message_id: i64,
    ) -> Result<ReceiptAdvance, TransportError> {
        self.check_reachable()?;
        self.with_state(|s| s.delivered_marks.push(up_to_message_id));
        Ok(advance(thread_id, up_to_message_id, ReceiptStatus::Delivered))
    }

    async fn fetch_receipts(
        &self,
        _thread_id: Uuid,
        message_ids: &[i64],
    ) -> Result<Vec<ReceiptDto>, TransportError> {
        self.check_reachable()?;
        Ok(self.with_state(|s| {
            s.receipts
                .iter()
                .filter(|r| message_ids.contains(&r.message_id))
                .cloned()
                .collect()
        }))
    }
}

// Sender identity the fake stamps on REST sends
const ME: Uuid = Uuid::from_u128(0xA11CE);

fn me() -> Uuid {
    ME
}

fn advance(thread_id: Uuid, up_to_message_id: i64, status: ReceiptStatus) -> ReceiptAdvance {
    ReceiptAdvance {
        thread_id,
        user_id: me(),
        up_to_message_id,
        status,
        cursor_advanced: true,
        receipts_updated: 1,
    }
}

fn test_config() -> SyncConfig {
    SyncConfig {
        reorder_delay: Duration::ZERO,
        ..SyncConfig::default()
    }
}

async fn open_engine(
    service: &FakeService,
    thread_id: Uuid,
    store: Arc<MemoryOutboxStore>,
) -> SyncEngine {
    SyncEngine::open(test_config(), thread_id, me(), Arc::new(service.clone()), store)
        .await
        .unwrap()
}

fn persisted_event(dto: &MessageDto, with_token: bool) -> PushEvent {
    let mut message = PersistedMessage::from(dto.clone());
    if !with_token {
        message.client_msg_id = None;
    }
    PushEvent::Persisted(message)
}

#[tokio::test]
async fn test_online_send_is_confirmed_with_server_id() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    let mut engine = open_engine(&service, thread, Arc::new(MemoryOutboxStore::new())).await;
    engine.bootstrap().await.unwrap();

    let token = engine.send("hello".into()).await.unwrap();

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    let message = &snapshot.messages[0];
    assert_eq!(message.client_msg_id, Some(token));
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(message.server_id, Some(1));
    assert_eq!(snapshot.pending_outbox, 0);
}

#[tokio::test]
async fn test_offline_send_converges_after_reconnect() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    let mut engine = open_engine(&service, thread, Arc::new(MemoryOutboxStore::new())).await;
    engine.bootstrap().await.unwrap();

    engine.set_online(false).await.unwrap();
    let token = engine.send("written on the train".into()).await.unwrap();

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.messages[0].status, MessageStatus::Sending);
    assert_eq!(snapshot.pending_outbox, 1);
    assert_eq!(service.with_state(|s| s.send_calls), 0);

    engine.set_online(true).await.unwrap();

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].client_msg_id, Some(token));
    assert_eq!(snapshot.messages[0].status, MessageStatus::Sent);
    assert!(snapshot.messages[0].server_id.is_some());
    assert_eq!(snapshot.pending_outbox, 0);
    assert_eq!(service.stored().len(), 1);
}

#[tokio::test]
async fn test_transient_failure_retries_with_same_token() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    let mut engine = open_engine(&service, thread, Arc::new(MemoryOutboxStore::new())).await;

    service.set_unreachable(true);
    let token = engine.send("hi".into()).await.unwrap();
    let snapshot = engine.snapshot();
    assert_eq!(snapshot.messages[0].status, MessageStatus::Failed);
    assert_eq!(snapshot.pending_outbox, 1);

    // Not due before its backoff elapses
    assert_eq!(engine.flush_outbox(Utc::now()).await.unwrap(), 0);

    service.set_unreachable(false);
    let later = Utc::now() + ChronoDuration::hours(1);
    assert_eq!(engine.flush_outbox(later).await.unwrap(), 1);

    let stored = service.stored();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].client_msg_id, token);
    let snapshot = engine.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].status, MessageStatus::Sent);
    assert_eq!(snapshot.pending_outbox, 0);
}

#[tokio::test]
async fn test_permanent_rejection_is_not_queued() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    let mut engine = open_engine(&service, thread, Arc::new(MemoryOutboxStore::new())).await;
    service.with_state(|s| s.reject_code = Some("THREAD_ARCHIVED".into()));

    let token = engine.send("too late".into()).await.unwrap();

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.messages[0].status, MessageStatus::Failed);
    assert_eq!(snapshot.pending_outbox, 0);

    // Manual retry is still allowed and keeps the token
    service.with_state(|s| s.reject_code = None);
    engine.retry(token).await.unwrap();
    assert_eq!(service.stored()[0].client_msg_id, token);
    assert_eq!(engine.snapshot().messages[0].status, MessageStatus::Sent);
}

#[tokio::test]
async fn test_retry_rejects_unknown_and_confirmed_messages() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    let mut engine = open_engine(&service, thread, Arc::new(MemoryOutboxStore::new())).await;
    let token = engine.send("ok".into()).await.unwrap();

    assert!(matches!(
        engine.retry(Uuid::new_v4()).await,
        Err(SyncError::UnknownMessage(_))
    ));
    assert!(matches!(
        engine.retry(token).await,
        Err(SyncError::NotRetryable(t)) if t == token
    ));
}

#[tokio::test]
async fn test_invalid_body_never_reaches_timeline() {
    let service = FakeService::default();
    let mut engine =
        open_engine(&service, Uuid::new_v4(), Arc::new(MemoryOutboxStore::new())).await;

    assert!(matches!(
        engine.send("   ".into()).await,
        Err(SyncError::InvalidBody(_))
    ));
    assert!(engine.snapshot().messages.is_empty());
}

#[tokio::test]
async fn test_backfill_closes_gap_across_pages() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    let peer = Uuid::new_v4();
    service.seed(thread, peer, 3);

    let mut engine = open_engine(&service, thread, Arc::new(MemoryOutboxStore::new())).await;
    assert_eq!(engine.bootstrap().await.unwrap(), 3);

    // Missed while disconnected, more than one page
    service.seed(thread, peer, 120);
    assert_eq!(engine.backfill().await.unwrap(), 120);

    let ids: Vec<i64> = engine
        .snapshot()
        .messages
        .iter()
        .filter_map(|m| m.server_id)
        .collect();
    assert_eq!(ids, (1..=123).collect::<Vec<i64>>());

    // Nothing new
    assert_eq!(engine.backfill().await.unwrap(), 0);
}

#[tokio::test]
async fn test_load_older_pages_backwards_without_duplicates() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    service.seed(thread, Uuid::new_v4(), 120);

    let mut engine = open_engine(&service, thread, Arc::new(MemoryOutboxStore::new())).await;
    assert_eq!(engine.bootstrap().await.unwrap(), 50);
    assert!(engine.snapshot().has_older);

    let oldest = engine.snapshot().messages[0].cursor().unwrap();
    assert_eq!(engine.load_older_than(oldest).await.unwrap(), 50);
    // Same page again merges nothing
    assert_eq!(engine.load_older_than(oldest).await.unwrap(), 0);

    assert_eq!(engine.load_older().await.unwrap(), 20);
    let snapshot = engine.snapshot();
    assert!(!snapshot.has_older);
    assert_eq!(snapshot.messages.len(), 120);
    assert_eq!(snapshot.messages[0].server_id, Some(1));
}

#[tokio::test]
async fn test_push_send_reconciles_ack_and_persisted() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    let mut engine = open_engine(&service, thread, Arc::new(MemoryOutboxStore::new())).await;
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    engine.on_push_connected(PushSender::new(frame_tx)).await.unwrap();

    let token = engine.send("over the socket".into()).await.unwrap();
    match frame_rx.try_recv().unwrap() {
        ClientFrame::SendMessage { client_msg_id, body, .. } => {
            assert_eq!(client_msg_id, token);
            assert_eq!(body, "over the socket");
        }
        other => panic!("unexpected frame {other:?}"),
    }
    assert!(engine.next_ack_deadline().is_some());

    let now = Instant::now();
    engine
        .handle_push(
            PushEvent::Ack {
                thread_id: thread,
                client_msg_id: token,
                sender_id: Some(me()),
                body: Some("over the socket".into()),
                timestamp: Utc::now(),
            },
            now,
        )
        .await
        .unwrap();
    assert_eq!(engine.snapshot().messages[0].status, MessageStatus::Sent);
    assert!(engine.next_ack_deadline().is_none());

    let local_id = engine.snapshot().messages[0].local_id;
    let stored = service.insert(thread, me(), token, "over the socket");
    engine.handle_push(persisted_event(&stored, true), now).await.unwrap();
    // Redelivery of the same event
    engine.handle_push(persisted_event(&stored, true), now).await.unwrap();

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].local_id, local_id);
    assert_eq!(snapshot.messages[0].server_id, Some(stored.id));
}

#[tokio::test]
async fn test_token_less_persisted_event_matches_own_placeholder() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    let mut engine = open_engine(&service, thread, Arc::new(MemoryOutboxStore::new())).await;
    let (frame_tx, _frame_rx) = mpsc::unbounded_channel();
    engine.on_push_connected(PushSender::new(frame_tx)).await.unwrap();

    let token = engine.send("no token echoed".into()).await.unwrap();
    let mut stored = service.insert(thread, me(), token, "no token echoed");
    stored.created_at = Utc::now();
    engine
        .handle_push(persisted_event(&stored, false), Instant::now())
        .await
        .unwrap();

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].client_msg_id, Some(token));
    assert_eq!(snapshot.messages[0].status, MessageStatus::Sent);
}

#[tokio::test]
async fn test_ack_timeout_fails_and_queues_push_send() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    let mut engine = open_engine(&service, thread, Arc::new(MemoryOutboxStore::new())).await;
    let (frame_tx, _frame_rx) = mpsc::unbounded_channel();
    engine.on_push_connected(PushSender::new(frame_tx)).await.unwrap();

    let token = engine.send("into the void".into()).await.unwrap();
    let deadline = engine.next_ack_deadline().unwrap();

    assert_eq!(engine.check_ack_timeouts(deadline - Duration::from_millis(1)).await.unwrap(), 0);
    assert_eq!(engine.check_ack_timeouts(deadline).await.unwrap(), 1);

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.messages[0].status, MessageStatus::Failed);
    assert_eq!(snapshot.pending_outbox, 1);

    // A late persisted event still confirms it and clears the outbox
    let stored = service.insert(thread, me(), token, "into the void");
    engine
        .handle_push(persisted_event(&stored, true), Instant::now())
        .await
        .unwrap();
    let snapshot = engine.snapshot();
    assert_eq!(snapshot.messages[0].status, MessageStatus::Sent);
    assert_eq!(snapshot.pending_outbox, 0);
}

#[tokio::test]
async fn test_disconnect_parks_unacked_push_sends() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    let mut engine = open_engine(&service, thread, Arc::new(MemoryOutboxStore::new())).await;
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    engine.on_push_connected(PushSender::new(frame_tx)).await.unwrap();

    let token = engine.send("maybe delivered".into()).await.unwrap();
    drop(frame_rx);
    engine.on_push_disconnected().await.unwrap();
    assert_eq!(engine.outbox_len(), 1);
    assert!(!engine.is_push_connected());

    assert_eq!(engine.flush_outbox(Utc::now()).await.unwrap(), 1);
    assert_eq!(service.stored()[0].client_msg_id, token);
    assert_eq!(engine.snapshot().messages[0].status, MessageStatus::Sent);
}

#[tokio::test]
async fn test_peer_message_reports_delivered_over_push() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    let peer = Uuid::new_v4();
    let mut engine = open_engine(&service, thread, Arc::new(MemoryOutboxStore::new())).await;
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    engine.on_push_connected(PushSender::new(frame_tx)).await.unwrap();

    let stored = service.insert(thread, peer, Uuid::new_v4(), "ping");
    engine
        .handle_push(persisted_event(&stored, true), Instant::now())
        .await
        .unwrap();

    match frame_rx.try_recv().unwrap() {
        ClientFrame::Delivered { up_to_message_id, .. } => assert_eq!(up_to_message_id, stored.id),
        other => panic!("unexpected frame {other:?}"),
    }

    // Redelivery does not report again
    engine
        .handle_push(persisted_event(&stored, true), Instant::now())
        .await
        .unwrap();
    assert!(frame_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_receipts_only_move_forward() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    let peer = Uuid::new_v4();
    let mut engine = open_engine(&service, thread, Arc::new(MemoryOutboxStore::new())).await;
    engine.send("first".into()).await.unwrap();
    engine.send("second".into()).await.unwrap();

    let receipt = |up_to: i64, status: ReceiptStatus| PushEvent::Receipt {
        thread_id: thread,
        user_id: peer,
        up_to_message_id: up_to,
        status,
    };
    let now = Instant::now();
    engine.handle_push(receipt(2, ReceiptStatus::Read), now).await.unwrap();
    engine.handle_push(receipt(2, ReceiptStatus::Delivered), now).await.unwrap();

    let statuses: Vec<MessageStatus> = engine
        .snapshot()
        .messages
        .iter()
        .map(|m| m.status)
        .collect();
    assert_eq!(statuses, vec![MessageStatus::Read, MessageStatus::Read]);
}

#[tokio::test]
async fn test_refresh_receipts_applies_stored_receipts() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    let peer = Uuid::new_v4();
    let mut engine = open_engine(&service, thread, Arc::new(MemoryOutboxStore::new())).await;
    engine.send("seen?".into()).await.unwrap();
    service.with_state(|s| {
        s.receipts.push(ReceiptDto {
            message_id: 1,
            user_id: peer,
            status: ReceiptStatus::Delivered,
            updated_at: Utc::now(),
        })
    });

    assert_eq!(engine.refresh_receipts().await.unwrap(), 1);
    assert_eq!(engine.snapshot().messages[0].status, MessageStatus::Delivered);
}

#[tokio::test]
async fn test_mark_read_reports_newest_incoming_once() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    service.seed(thread, Uuid::new_v4(), 4);
    let mut engine = open_engine(&service, thread, Arc::new(MemoryOutboxStore::new())).await;
    engine.bootstrap().await.unwrap();
    engine.send("my own reply".into()).await.unwrap();

    assert!(engine.mark_read().await.unwrap());
    assert!(!engine.mark_read().await.unwrap());
    assert_eq!(service.with_state(|s| s.read_marks.clone()), vec![4]);
}

#[tokio::test]
async fn test_unsent_messages_survive_reopen() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    let store = Arc::new(MemoryOutboxStore::new());

    let mut first = open_engine(&service, thread, store.clone()).await;
    first.set_online(false).await.unwrap();
    let token = first.send("before the crash".into()).await.unwrap();
    first.close().await.unwrap();

    let mut second = open_engine(&service, thread, store).await;
    let snapshot = second.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].client_msg_id, Some(token));
    assert_eq!(snapshot.messages[0].status, MessageStatus::Sending);

    assert_eq!(second.flush_outbox(Utc::now()).await.unwrap(), 1);
    assert_eq!(second.snapshot().messages[0].status, MessageStatus::Sent);
    assert_eq!(second.outbox_len(), 0);
}

#[tokio::test]
async fn test_events_for_other_threads_are_ignored() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    let other = Uuid::new_v4();
    let mut engine = open_engine(&service, thread, Arc::new(MemoryOutboxStore::new())).await;

    let stored = service.insert(other, Uuid::new_v4(), Uuid::new_v4(), "elsewhere");
    engine
        .handle_push(persisted_event(&stored, true), Instant::now())
        .await
        .unwrap();
    assert!(engine.snapshot().messages.is_empty());
}

#[tokio::test]
async fn test_reconnect_reports_delivered_over_rest() {
    let service = FakeService::default();
    let thread = Uuid::new_v4();
    service.seed(thread, Uuid::new_v4(), 2);
    let mut engine = open_engine(&service, thread, Arc::new(MemoryOutboxStore::new())).await;

    engine.set_online(false).await.unwrap();
    engine.set_online(true).await.unwrap();

    assert_eq!(engine.snapshot().messages.len(), 2);
    assert_eq!(service.with_state(|s| s.delivered_marks.clone()), vec![2]);
}
