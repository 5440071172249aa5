use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    RwLock,
};
use uuid::Uuid;

/// Identifies one room subscription of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

struct Subscriber {
    id: SubscriberId,
    sender: UnboundedSender<String>,
}

/// Connections attached to each thread room on this instance.
///
/// Sends go through unbounded channels, so a slow peer never blocks the
/// broadcaster; a closed peer is dropped on the next broadcast.
#[derive(Default, Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, Vec<Subscriber>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_subscriber(
        &self,
        thread_id: Uuid,
        user_id: Uuid,
    ) -> (SubscriberId, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        let subscriber_id = SubscriberId::new();

        let mut guard = self.inner.write().await;
        let room = guard.entry(thread_id).or_default();
        room.push(Subscriber {
            id: subscriber_id,
            sender: tx,
        });

        tracing::debug!(
            ?subscriber_id,
            %thread_id,
            %user_id,
            subscribers = room.len(),
            "subscriber joined room"
        );

        (subscriber_id, rx)
    }

    /// Must be called when a connection closes
    pub async fn remove_subscriber(&self, thread_id: Uuid, subscriber_id: SubscriberId) {
        let mut guard = self.inner.write().await;

        if let Some(subscribers) = guard.get_mut(&thread_id) {
            subscribers.retain(|s| s.id != subscriber_id);
            if subscribers.is_empty() {
                guard.remove(&thread_id);
                tracing::debug!(%thread_id, "room emptied");
            }
        }
    }

    /// Fire-and-forget fan-out to every connection in the room. Returns how many
    /// connections accepted the frame.
    pub async fn broadcast(&self, thread_id: Uuid, msg: String) -> usize {
        let mut guard = self.inner.write().await;
        let Some(subscribers) = guard.get_mut(&thread_id) else {
            return 0;
        };

        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.sender.send(msg.clone()).is_ok());
        let after = subscribers.len();
        if before != after {
            tracing::debug!(%thread_id, dropped = before - after, "closed subscribers removed");
        }
        if subscribers.is_empty() {
            guard.remove(&thread_id);
        }
        after
    }

    pub async fn subscriber_count(&self, thread_id: Uuid) -> usize {
        let guard = self.inner.read().await;
        guard.get(&thread_id).map(|v| v.len()).unwrap_or(0)
    }
}
