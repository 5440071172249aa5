// In-process service for integration tests
//
// Wires the gateway, a persistence worker and the fanout listener over the
// memory store and broker, and exposes them to the client engine through the
// same transport traits the HTTP and WebSocket clients implement.

#![allow(dead_code)]

use async_trait::async_trait;
use dm_sync_client::transport::{PushChannel, PushSender, PushSubscription, SyncTransport};
use dm_sync_client::{MemoryOutboxStore, SyncConfig, SyncEngine, TransportError};
use dm_sync_service::broker::{Broker, MemoryBroker};
use dm_sync_service::config::Config;
use dm_sync_service::error::AppError;
use dm_sync_service::gateway::{run_fanout_listener, ConnectionRegistry, IngressGateway};
use dm_sync_service::middleware::error_handling::map_error;
use dm_sync_service::models::PageQuery;
use dm_sync_service::store::{MemoryMessageStore, MessageStore};
use dm_sync_service::worker::{EntryOutcome, PersistenceWorker, WorkerConfig};
use event_schema::{
    ClientFrame, Cursor, MessageDto, MessagePage, PushEvent, ReceiptAdvance, ReceiptDto,
    ServerFrame,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Time for spawned relays to move frames between channels
pub const SETTLE: Duration = Duration::from_millis(50);

pub struct Harness {
    pub config: Config,
    pub store: Arc<MemoryMessageStore>,
    pub broker: Arc<MemoryBroker>,
    pub gateway: IngressGateway,
    pub worker: PersistenceWorker,
    shutdown: watch::Sender<bool>,
    fanout: JoinHandle<()>,
}

impl Harness {
    /// The first stored message gets `first_message_id`
    pub async fn start(first_message_id: i64) -> Self {
        let config = Config::test_defaults();
        let store = Arc::new(MemoryMessageStore::starting_at(first_message_id));
        let broker = Arc::new(MemoryBroker::new());
        let gateway = IngressGateway::new(
            store.clone(),
            broker.clone(),
            ConnectionRegistry::new(),
            config.instance_id.clone(),
            config.max_body_bytes,
        );
        let worker = PersistenceWorker::new(
            store.clone(),
            broker.clone(),
            WorkerConfig {
                block: Duration::from_millis(10),
                ..WorkerConfig::from_config(&config, 0)
            },
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let fanout = tokio::spawn(run_fanout_listener(
            broker.clone(),
            gateway.registry().clone(),
            config.instance_id.clone(),
            config.streams.batch_size,
            config.streams.block,
            shutdown_rx,
        ));
        // Let the listener read the fanout tail before anything is published
        tokio::task::yield_now().await;

        Self {
            config,
            store,
            broker,
            gateway,
            worker,
            shutdown,
            fanout,
        }
    }

    pub async fn direct_thread(&self, a: Uuid, b: Uuid) -> Uuid {
        self.store.create_thread(a, &[b]).await.unwrap().id
    }

    pub fn transport(&self, user_id: Uuid) -> Arc<GatewayTransport> {
        Arc::new(GatewayTransport {
            gateway: self.gateway.clone(),
            store: self.store.clone(),
            user_id,
            reachable: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn push(&self, user_id: Uuid) -> Arc<GatewayPush> {
        Arc::new(GatewayPush {
            gateway: self.gateway.clone(),
            user_id,
        })
    }

    pub async fn engine(&self, thread_id: Uuid, user_id: Uuid) -> SyncEngine {
        SyncEngine::open(
            client_config(),
            thread_id,
            user_id,
            self.transport(user_id),
            Arc::new(MemoryOutboxStore::new()),
        )
        .await
        .unwrap()
    }

    /// Run the worker until the ingest stream has nothing new
    pub async fn drain_worker(&self) -> Vec<EntryOutcome> {
        let mut all = Vec::new();
        loop {
            let batch = self.worker.run_once().await.unwrap();
            if batch.is_empty() {
                return all;
            }
            all.extend(batch);
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.fanout.await;
    }
}

pub fn client_config() -> SyncConfig {
    SyncConfig {
        reorder_delay: Duration::ZERO,
        ..SyncConfig::default()
    }
}

fn to_transport_error(err: AppError) -> TransportError {
    let (status, body) = map_error(&err);
    TransportError::Server {
        status: status.as_u16(),
        code: body.code,
        message: body.message,
    }
}

/// Request/response surface, calling the same gateway methods as the routes
pub struct GatewayTransport {
    gateway: IngressGateway,
    store: Arc<MemoryMessageStore>,
    user_id: Uuid,
    reachable: Arc<AtomicBool>,
}

impl GatewayTransport {
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), TransportError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Network("connection refused".to_string()));
        }
        Ok(())
    }

    async fn page(&self, thread_id: Uuid, query: PageQuery) -> Result<MessagePage, TransportError> {
        self.check()?;
        self.gateway
            .authorize(thread_id, self.user_id)
            .await
            .map_err(to_transport_error)?;
        self.store
            .list_messages(thread_id, query)
            .await
            .map_err(|e| to_transport_error(e.into()))
    }
}

#[async_trait]
impl SyncTransport for GatewayTransport {
    async fn fetch_latest(
        &self,
        thread_id: Uuid,
        limit: i64,
    ) -> Result<MessagePage, TransportError> {
        self.page(thread_id, PageQuery::Latest { limit }).await
    }

    async fn fetch_before(
        &self,
        thread_id: Uuid,
        cursor: Cursor,
        limit: i64,
    ) -> Result<MessagePage, TransportError> {
        self.page(thread_id, PageQuery::Before { cursor, limit }).await
    }

    async fn fetch_after(
        &self,
        thread_id: Uuid,
        cursor: Cursor,
        limit: i64,
    ) -> Result<MessagePage, TransportError> {
        self.page(thread_id, PageQuery::After { cursor, limit }).await
    }

    async fn send_message(
        &self,
        thread_id: Uuid,
        client_msg_id: Uuid,
        body: &str,
    ) -> Result<MessageDto, TransportError> {
        self.check()?;
        self.gateway
            .send_durable(thread_id, self.user_id, body.to_string(), client_msg_id)
            .await
            .map(|outcome| outcome.message)
            .map_err(to_transport_error)
    }

    async fn mark_read(
        &self,
        thread_id: Uuid,
        up_to_message_id: i64,
    ) -> Result<ReceiptAdvance, TransportError> {
        self.check()?;
        self.gateway
            .mark_read(thread_id, self.user_id, up_to_message_id)
            .await
            .map_err(to_transport_error)
    }

    async fn mark_delivered(
        &self,
        thread_id: Uuid,
        up_to_message_id: i64,
    ) -> Result<ReceiptAdvance, TransportError> {
        self.check()?;
        self.gateway
            .mark_delivered(thread_id, self.user_id, up_to_message_id)
            .await
            .map_err(to_transport_error)
    }

    async fn fetch_receipts(
        &self,
        thread_id: Uuid,
        message_ids: &[i64],
    ) -> Result<Vec<ReceiptDto>, TransportError> {
        self.check()?;
        self.gateway
            .receipts(thread_id, self.user_id, message_ids)
            .await
            .map_err(to_transport_error)
    }
}

/// Push surface: a room subscription plus the frame dispatch the WebSocket
/// session performs
pub struct GatewayPush {
    gateway: IngressGateway,
    user_id: Uuid,
}

async fn dispatch(
    gateway: &IngressGateway,
    user_id: Uuid,
    frame: ClientFrame,
    events: &mpsc::UnboundedSender<PushEvent>,
) {
    let thread_id = frame.thread_id();
    let (client_msg_id, result) = match frame {
        ClientFrame::SendMessage {
            thread_id,
            body,
            client_msg_id,
        } => (
            Some(client_msg_id),
            gateway
                .send(thread_id, user_id, body, client_msg_id)
                .await
                .map(|_| ()),
        ),
        ClientFrame::Typing { thread_id, typing } => {
            gateway.typing(thread_id, user_id, typing).await;
            (None, Ok(()))
        }
        ClientFrame::Presence { thread_id, online } => {
            gateway.presence(thread_id, user_id, online).await;
            (None, Ok(()))
        }
        ClientFrame::Delivered {
            thread_id,
            up_to_message_id,
        } => (
            None,
            gateway
                .mark_delivered(thread_id, user_id, up_to_message_id)
                .await
                .map(|_| ()),
        ),
        ClientFrame::MarkRead {
            thread_id,
            up_to_message_id,
        } => (
            None,
            gateway
                .mark_read(thread_id, user_id, up_to_message_id)
                .await
                .map(|_| ()),
        ),
    };

    if let Err(e) = result {
        let (_, body) = map_error(&e);
        let frame = ServerFrame::Error {
            thread_id,
            client_msg_id,
            code: body.code,
            message: body.message,
        };
        let _ = events.send(frame.into());
    }
}

#[async_trait]
impl PushChannel for GatewayPush {
    async fn subscribe(&self, thread_id: Uuid) -> Result<PushSubscription, TransportError> {
        self.gateway
            .authorize(thread_id, self.user_id)
            .await
            .map_err(to_transport_error)?;
        let registry = self.gateway.registry().clone();
        let (subscriber_id, mut room) = registry.add_subscriber(thread_id, self.user_id).await;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let gateway = self.gateway.clone();
        let user_id = self.user_id;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    frame = frame_rx.recv() => match frame {
                        Some(frame) => dispatch(&gateway, user_id, frame, &event_tx).await,
                        None => break,
                    },
                    json = room.recv() => match json {
                        Some(json) => {
                            if let Ok(event) = PushEvent::from_json(&json) {
                                if event_tx.send(event).is_err() {
                                    break;
                                }
                            }
                        }
                        None => break,
                    },
                }
            }
            registry.remove_subscriber(thread_id, subscriber_id).await;
        });

        Ok(PushSubscription::new(
            event_rx,
            PushSender::new(frame_tx),
            cancel_tx,
        ))
    }
}

/// Wait for relays, then hand every queued event to the engine. Returns the
/// events in arrival order.
pub async fn pump(engine: &mut SyncEngine, subscription: &mut PushSubscription) -> Vec<PushEvent> {
    tokio::time::sleep(SETTLE).await;
    let mut seen = Vec::new();
    while let Ok(event) = subscription.events.try_recv() {
        seen.push(event.clone());
        engine
            .handle_push(event, tokio::time::Instant::now())
            .await
            .unwrap();
    }
    seen
}
