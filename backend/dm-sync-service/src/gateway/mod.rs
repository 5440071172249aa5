//! Ingress gateway: validates client frames, fans them out to the room and hands
//! sends to the broker for persistence.

pub mod fanout;
pub mod registry;

use chrono::Utc;
use event_schema::broker::validate_body;
use event_schema::{
    EventEnvelope, FanoutEvent, MessageSendEvent, ReceiptAdvance, ReceiptDto, ReceiptStatus,
    ServerFrame,
};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{InsertOutcome, NewMessage, Thread};
use crate::store::MessageStore;

pub use fanout::run_fanout_listener;
pub use registry::{ConnectionRegistry, SubscriberId};

/// `source` of ingest envelopes produced here
pub const GATEWAY_SOURCE: &str = "ingress-gateway";

/// Upper bound on ids per receipt lookup
pub const MAX_RECEIPT_BATCH: usize = 500;

/// What the sender learns from an accepted send
#[derive(Debug, Clone)]
pub struct SendAccepted {
    pub ack: ServerFrame,
    /// Ingest stream entry holding the event
    pub entry_id: String,
}

#[derive(Clone)]
pub struct IngressGateway {
    store: Arc<dyn MessageStore>,
    broker: Arc<dyn Broker>,
    registry: ConnectionRegistry,
    instance_id: String,
    max_body_bytes: usize,
}

impl IngressGateway {
    pub fn new(
        store: Arc<dyn MessageStore>,
        broker: Arc<dyn Broker>,
        registry: ConnectionRegistry,
        instance_id: impl Into<String>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            store,
            broker,
            registry,
            instance_id: instance_id.into(),
            max_body_bytes,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Load the thread and require `user_id` to be one of its participants
    pub async fn authorize(&self, thread_id: Uuid, user_id: Uuid) -> AppResult<Thread> {
        let thread = self.store.get_thread(thread_id).await?;
        if !thread.is_participant(user_id) {
            return Err(AppError::Forbidden);
        }
        Ok(thread)
    }

    async fn authorize_send(
        &self,
        thread_id: Uuid,
        sender_id: Uuid,
        body: &str,
    ) -> AppResult<Thread> {
        validate_body(body, self.max_body_bytes).map_err(|e| AppError::InvalidBody(e.to_string()))?;
        let thread = self.authorize(thread_id, sender_id).await?;
        if thread.is_archived() {
            return Err(AppError::ThreadArchived);
        }
        Ok(thread)
    }

    /// Accept a send: broadcast the fast ack to the room, then enqueue the event
    /// for persistence. The room may see the message before it is durable.
    pub async fn send(
        &self,
        thread_id: Uuid,
        sender_id: Uuid,
        body: String,
        client_msg_id: Uuid,
    ) -> AppResult<SendAccepted> {
        self.authorize_send(thread_id, sender_id, &body).await?;

        let received_at = Utc::now();
        let ack = ServerFrame::MessageAck {
            thread_id,
            client_msg_id,
            sender_id,
            body: body.clone(),
            timestamp: received_at,
        };
        self.broadcast(&ack).await;
        metrics::record_ack_broadcast();

        let envelope = EventEnvelope::new(
            GATEWAY_SOURCE,
            MessageSendEvent {
                thread_id,
                sender_id,
                client_msg_id,
                body,
                received_at,
            },
        )
        .with_correlation_id(client_msg_id);

        match self.broker.enqueue_send(&envelope).await {
            Ok(entry_id) => {
                metrics::record_enqueue(true);
                debug!(%thread_id, %client_msg_id, %entry_id, "send enqueued");
                Ok(SendAccepted { ack, entry_id })
            }
            Err(e) => {
                metrics::record_enqueue(false);
                error!(%thread_id, %client_msg_id, error = %e, "enqueue failed after ack");
                Err(e.into())
            }
        }
    }

    /// Synchronous path for clients without a push connection: store the row
    /// now and announce it as persisted. The room still sees the ack first, so
    /// peers observe the same frame sequence as for a push send.
    pub async fn send_durable(
        &self,
        thread_id: Uuid,
        sender_id: Uuid,
        body: String,
        client_msg_id: Uuid,
    ) -> AppResult<InsertOutcome> {
        self.authorize_send(thread_id, sender_id, &body).await?;
        self.broadcast(&ServerFrame::MessageAck {
            thread_id,
            client_msg_id,
            sender_id,
            body: body.clone(),
            timestamp: Utc::now(),
        })
        .await;
        metrics::record_ack_broadcast();

        let outcome = self
            .store
            .insert_message(&NewMessage {
                thread_id,
                sender_id,
                client_msg_id,
                body,
            })
            .await?;
        metrics::record_persisted(outcome.created);
        self.broadcast(&ServerFrame::persisted(&outcome.message)).await;
        Ok(outcome)
    }

    /// Best effort; the caller's connection was authorized on upgrade
    pub async fn typing(&self, thread_id: Uuid, user_id: Uuid, typing: bool) {
        self.broadcast(&ServerFrame::Typing {
            thread_id,
            user_id,
            typing,
        })
        .await;
    }

    /// Best effort; the caller's connection was authorized on upgrade
    pub async fn presence(&self, thread_id: Uuid, user_id: Uuid, online: bool) {
        self.broadcast(&ServerFrame::Presence {
            thread_id,
            user_id,
            online,
        })
        .await;
    }

    pub async fn mark_read(
        &self,
        thread_id: Uuid,
        user_id: Uuid,
        up_to_message_id: i64,
    ) -> AppResult<ReceiptAdvance> {
        self.advance(thread_id, user_id, up_to_message_id, ReceiptStatus::Read)
            .await
    }

    pub async fn mark_delivered(
        &self,
        thread_id: Uuid,
        user_id: Uuid,
        up_to_message_id: i64,
    ) -> AppResult<ReceiptAdvance> {
        self.advance(thread_id, user_id, up_to_message_id, ReceiptStatus::Delivered)
            .await
    }

    async fn advance(
        &self,
        thread_id: Uuid,
        user_id: Uuid,
        up_to_message_id: i64,
        status: ReceiptStatus,
    ) -> AppResult<ReceiptAdvance> {
        self.authorize(thread_id, user_id).await?;
        let advance = self
            .store
            .advance_receipts(thread_id, user_id, up_to_message_id, status)
            .await?;

        if advance.cursor_advanced || advance.receipts_updated > 0 {
            self.broadcast(&ServerFrame::ReceiptUpdated {
                thread_id,
                user_id,
                up_to_message_id,
                status,
            })
            .await;
        }
        Ok(advance)
    }

    /// Receipts on the caller's own messages; unknown ids are omitted
    pub async fn receipts(
        &self,
        thread_id: Uuid,
        caller: Uuid,
        message_ids: &[i64],
    ) -> AppResult<Vec<ReceiptDto>> {
        if message_ids.len() > MAX_RECEIPT_BATCH {
            return Err(AppError::BadRequest(format!(
                "at most {MAX_RECEIPT_BATCH} message ids per request"
            )));
        }
        self.authorize(thread_id, caller).await?;
        Ok(self
            .store
            .receipts_for(thread_id, caller, message_ids)
            .await?)
    }

    /// Deliver to local connections, then relay to other instances. Never fails:
    /// a participant that misses the frame catches up through backfill.
    pub async fn broadcast(&self, frame: &ServerFrame) {
        let thread_id = frame.thread_id();
        match frame.to_json() {
            Ok(json) => {
                self.registry.broadcast(thread_id, json).await;
            }
            Err(e) => {
                error!(%thread_id, error = %e, "frame serialization failed");
                return;
            }
        }

        let event = FanoutEvent::new(self.instance_id.clone(), frame.clone());
        if let Err(e) = self.broker.publish_fanout(&event).await {
            warn!(%thread_id, kind = frame.event_type(), error = %e, "fanout publish failed");
        }
    }
}
