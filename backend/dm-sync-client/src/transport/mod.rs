//! Seams between the engine and the network.
//!
//! [`SyncTransport`] is the request/response surface, [`PushChannel`] the
//! realtime one. The engine only sees [`PushEvent`]s, already normalized, so the
//! same state machine runs over any push mechanism.

pub mod http;
pub mod ws;

use async_trait::async_trait;
use event_schema::{
    ClientFrame, Cursor, MessageDto, MessagePage, PushEvent, ReceiptAdvance, ReceiptDto,
};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::TransportError;

pub use http::HttpTransport;
pub use ws::WsPushChannel;

#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Newest page, ascending
    async fn fetch_latest(&self, thread_id: Uuid, limit: i64)
        -> Result<MessagePage, TransportError>;

    /// Page strictly older than `cursor`, ascending
    async fn fetch_before(
        &self,
        thread_id: Uuid,
        cursor: Cursor,
        limit: i64,
    ) -> Result<MessagePage, TransportError>;

    /// Page strictly newer than `cursor`, ascending
    async fn fetch_after(
        &self,
        thread_id: Uuid,
        cursor: Cursor,
        limit: i64,
    ) -> Result<MessagePage, TransportError>;

    /// Durable send; resolves to the canonical row even when the token was
    /// already stored
    async fn send_message(
        &self,
        thread_id: Uuid,
        client_msg_id: Uuid,
        body: &str,
    ) -> Result<MessageDto, TransportError>;

    async fn mark_read(&self, thread_id: Uuid, up_to_message_id: i64)
        -> Result<ReceiptAdvance, TransportError>;

    async fn mark_delivered(
        &self,
        thread_id: Uuid,
        up_to_message_id: i64,
    ) -> Result<ReceiptAdvance, TransportError>;

    async fn fetch_receipts(
        &self,
        thread_id: Uuid,
        message_ids: &[i64],
    ) -> Result<Vec<ReceiptDto>, TransportError>;
}

/// Outbound half of a push subscription
#[derive(Debug, Clone)]
pub struct PushSender {
    tx: mpsc::UnboundedSender<ClientFrame>,
}

impl PushSender {
    pub fn new(tx: mpsc::UnboundedSender<ClientFrame>) -> Self {
        Self { tx }
    }

    pub fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Disconnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A live subscription to one thread's room. `events` ends when the connection
/// drops; dropping the subscription closes it.
pub struct PushSubscription {
    pub events: mpsc::UnboundedReceiver<PushEvent>,
    pub sender: PushSender,
    cancel: Option<oneshot::Sender<()>>,
}

impl PushSubscription {
    pub fn new(
        events: mpsc::UnboundedReceiver<PushEvent>,
        sender: PushSender,
        cancel: oneshot::Sender<()>,
    ) -> Self {
        Self {
            events,
            sender,
            cancel: Some(cancel),
        }
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

impl Drop for PushSubscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn subscribe(&self, thread_id: Uuid) -> Result<PushSubscription, TransportError>;
}
