//! Client-local queue of sends the server has not confirmed yet.
//!
//! The outbox is written through to an [`OutboxStore`] on every change so a
//! crash or reload does not lose unsent messages.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use resilience::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::OutboxError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxItem {
    /// Never regenerated across retries
    pub client_msg_id: Uuid,
    pub thread_id: Uuid,
    pub body: String,
    /// Failed attempts so far
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn load(&self, thread_id: Uuid) -> Result<Vec<OutboxItem>, OutboxError>;

    /// Replace the stored items of a thread
    async fn save(&self, thread_id: Uuid, items: &[OutboxItem]) -> Result<(), OutboxError>;
}

/// Process-lifetime store, for tests and ephemeral sessions
#[derive(Default, Clone)]
pub struct MemoryOutboxStore {
    items: Arc<Mutex<HashMap<Uuid, Vec<OutboxItem>>>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn load(&self, thread_id: Uuid) -> Result<Vec<OutboxItem>, OutboxError> {
        Ok(self
            .items
            .lock()
            .await
            .get(&thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, thread_id: Uuid, items: &[OutboxItem]) -> Result<(), OutboxError> {
        let mut guard = self.items.lock().await;
        if items.is_empty() {
            guard.remove(&thread_id);
        } else {
            guard.insert(thread_id, items.to_vec());
        }
        Ok(())
    }
}

/// One JSON file per thread under `dir`. Writes go to a temp file that is
/// renamed over the old one, so a crash leaves either the old or the new list.
#[derive(Debug, Clone)]
pub struct FileOutboxStore {
    dir: PathBuf,
}

impl FileOutboxStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, OutboxError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, thread_id: Uuid) -> PathBuf {
        self.dir.join(format!("outbox-{thread_id}.json"))
    }
}

#[async_trait]
impl OutboxStore for FileOutboxStore {
    async fn load(&self, thread_id: Uuid) -> Result<Vec<OutboxItem>, OutboxError> {
        match tokio::fs::read(self.path_for(thread_id)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, thread_id: Uuid, items: &[OutboxItem]) -> Result<(), OutboxError> {
        let path = self.path_for(thread_id);
        if items.is_empty() {
            return match tokio::fs::remove_file(&path).await {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(items)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

fn after(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero())
}

/// Pending sends of one thread with per-item exponential backoff
pub struct Outbox {
    thread_id: Uuid,
    store: Arc<dyn OutboxStore>,
    backoff: BackoffPolicy,
    items: Vec<OutboxItem>,
}

impl Outbox {
    pub async fn open(
        thread_id: Uuid,
        store: Arc<dyn OutboxStore>,
        backoff: BackoffPolicy,
    ) -> Result<Self, OutboxError> {
        let mut items = store.load(thread_id).await?;
        items.sort_by_key(|i| i.created_at);
        Ok(Self {
            thread_id,
            store,
            backoff,
            items,
        })
    }

    pub fn items(&self) -> &[OutboxItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, client_msg_id: Uuid) -> bool {
        self.items.iter().any(|i| i.client_msg_id == client_msg_id)
    }

    async fn persist(&self) -> Result<(), OutboxError> {
        self.store.save(self.thread_id, &self.items).await
    }

    /// Queue a send after `attempts` failures; `attempts == 0` makes it due now.
    /// A token already queued is kept as is.
    pub async fn enqueue(
        &mut self,
        client_msg_id: Uuid,
        body: String,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        if self.contains(client_msg_id) {
            return Ok(());
        }
        self.items.push(OutboxItem {
            client_msg_id,
            thread_id: self.thread_id,
            body,
            attempts,
            next_retry_at: after(now, self.backoff.delay_for(attempts)),
            created_at: now,
        });
        self.persist().await
    }

    /// Items whose retry time has come, oldest first
    pub fn due(&self, now: DateTime<Utc>) -> Vec<OutboxItem> {
        self.items
            .iter()
            .filter(|i| i.next_retry_at <= now)
            .cloned()
            .collect()
    }

    pub async fn record_failure(
        &mut self,
        client_msg_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        let backoff = &self.backoff;
        let Some(item) = self
            .items
            .iter_mut()
            .find(|i| i.client_msg_id == client_msg_id)
        else {
            return Ok(());
        };
        item.attempts = item.attempts.saturating_add(1);
        item.next_retry_at = after(now, backoff.delay_for(item.attempts));
        self.persist().await
    }

    /// Make every item due now. Used when connectivity comes back.
    pub async fn reset_schedule(&mut self, now: DateTime<Utc>) -> Result<(), OutboxError> {
        if self.items.iter().all(|i| i.next_retry_at <= now) {
            return Ok(());
        }
        for item in &mut self.items {
            item.next_retry_at = item.next_retry_at.min(now);
        }
        self.persist().await
    }

    pub async fn remove(&mut self, client_msg_id: Uuid) -> Result<bool, OutboxError> {
        let before = self.items.len();
        self.items.retain(|i| i.client_msg_id != client_msg_id);
        if self.items.len() == before {
            return Ok(false);
        }
        self.persist().await?;
        Ok(true)
    }
}
