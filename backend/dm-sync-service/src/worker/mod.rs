//! Persistence worker: turns at-least-once ingest delivery into exactly one row
//!
//! Every entry ends in one of three ways. Stored (or already stored): publish
//! `message_persisted`, then ack. Deterministically bad: dead-letter, then ack.
//! Anything transient: leave it pending so it is redelivered or claimed.

pub mod pool;

use event_schema::{FanoutEvent, MessageSendEvent, ServerFrame};
use resilience::BackoffPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, StreamEntry};
use crate::config::Config;
use crate::metrics;
use crate::models::NewMessage;
use crate::store::MessageStore;

pub use pool::spawn_worker_pool;

/// Origin stamped on fanout events published by workers
pub const WORKER_ORIGIN: &str = "persistence-worker";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub consumer: String,
    pub batch_size: usize,
    pub block: Duration,
    pub claim_idle: Duration,
    pub max_deliveries: u64,
    pub max_body_bytes: usize,
    /// Pause between failed polls of the broker
    pub poll_backoff: BackoffPolicy,
}

impl WorkerConfig {
    /// Settings for the `index`-th worker of this process
    pub fn from_config(cfg: &Config, index: usize) -> Self {
        Self {
            consumer: format!("{}-{}", cfg.streams.consumer_name, index),
            batch_size: cfg.streams.batch_size,
            block: cfg.streams.block,
            claim_idle: cfg.streams.claim_idle,
            max_deliveries: cfg.streams.max_deliveries,
            max_body_bytes: cfg.max_body_bytes,
            poll_backoff: resilience::presets::worker_poll_backoff(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Persisted { message_id: i64, created: bool },
    DeadLettered(String),
    /// Left unacknowledged
    Retry(String),
}

pub struct PersistenceWorker {
    store: Arc<dyn MessageStore>,
    broker: Arc<dyn Broker>,
    config: WorkerConfig,
}

impl PersistenceWorker {
    pub fn new(
        store: Arc<dyn MessageStore>,
        broker: Arc<dyn Broker>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            broker,
            config,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.config.consumer
    }

    pub async fn process_entry(&self, entry: &StreamEntry) -> EntryOutcome {
        if entry.deliveries > self.config.max_deliveries {
            return self
                .dead_letter(
                    entry,
                    "max_deliveries",
                    format!("delivered {} times", entry.deliveries),
                )
                .await;
        }

        let envelope = match MessageSendEvent::from_fields(&entry.fields) {
            Ok(envelope) => envelope,
            Err(e) => return self.dead_letter(entry, "malformed", e.to_string()).await,
        };
        let event = envelope.data;
        if let Err(e) = event.validate(self.config.max_body_bytes) {
            return self.dead_letter(entry, "invalid", e.to_string()).await;
        }

        let new_message = NewMessage {
            thread_id: event.thread_id,
            sender_id: event.sender_id,
            client_msg_id: event.client_msg_id,
            body: event.body,
        };

        let outcome = match self.store.insert_message(&new_message).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_transient() => {
                warn!(entry_id = %entry.id, error = %e, "insert failed, leaving entry pending");
                metrics::record_worker_retry();
                return EntryOutcome::Retry(e.to_string());
            }
            Err(e) => return self.dead_letter(entry, "rejected", e.to_string()).await,
        };
        metrics::record_persisted(outcome.created);

        // A duplicate still republishes: the first attempt may have died before publishing
        let frame = ServerFrame::persisted(&outcome.message);
        if let Err(e) = self
            .broker
            .publish_fanout(&FanoutEvent::new(WORKER_ORIGIN, frame))
            .await
        {
            warn!(entry_id = %entry.id, error = %e, "publish of message_persisted failed");
            metrics::record_worker_retry();
            return EntryOutcome::Retry(e.to_string());
        }

        if let Err(e) = self.broker.ack(&entry.id).await {
            // Redelivery collapses onto the stored row
            warn!(entry_id = %entry.id, error = %e, "ack failed");
            return EntryOutcome::Retry(e.to_string());
        }

        debug!(
            entry_id = %entry.id,
            message_id = outcome.message.id,
            created = outcome.created,
            "entry persisted"
        );
        EntryOutcome::Persisted {
            message_id: outcome.message.id,
            created: outcome.created,
        }
    }

    async fn dead_letter(
        &self,
        entry: &StreamEntry,
        kind: &'static str,
        detail: String,
    ) -> EntryOutcome {
        let reason = format!("{kind}: {detail}");
        warn!(entry_id = %entry.id, deliveries = entry.deliveries, %reason, "dead-lettering entry");

        if let Err(e) = self.broker.dead_letter(entry, &reason).await {
            error!(entry_id = %entry.id, error = %e, "dead-letter stream write failed");
            return EntryOutcome::Retry(e.to_string());
        }

        let payload = serde_json::to_value(&entry.fields).unwrap_or(serde_json::Value::Null);
        if let Err(e) = self.store.record_dead_letter(&entry.id, &reason, &payload).await {
            // The stream copy is enough to recover it
            warn!(entry_id = %entry.id, error = %e, "dead-letter row not recorded");
        }

        if let Err(e) = self.broker.ack(&entry.id).await {
            return EntryOutcome::Retry(e.to_string());
        }
        metrics::record_dead_letter(kind);
        EntryOutcome::DeadLettered(reason)
    }

    /// Claim stale entries from dead consumers, otherwise read new ones, and
    /// process the batch. Returns the outcomes in entry order.
    pub async fn run_once(&self) -> Result<Vec<EntryOutcome>, BrokerError> {
        let mut entries = self
            .broker
            .claim_stale(&self.config.consumer, self.config.claim_idle, self.config.batch_size)
            .await?;
        if entries.is_empty() {
            entries = self
                .broker
                .read_group(&self.config.consumer, self.config.batch_size, self.config.block)
                .await?;
        } else {
            metrics::record_claimed(entries.len());
        }

        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in &entries {
            outcomes.push(self.process_entry(entry).await);
        }
        Ok(outcomes)
    }

    /// Poll until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(consumer = %self.config.consumer, "persistence worker started");
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                result = self.run_once() => match result {
                    Ok(_) => failures = 0,
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let delay = self.config.poll_backoff.delay_for(failures);
                        error!(
                            consumer = %self.config.consumer,
                            error = %e,
                            ?delay,
                            "broker poll failed"
                        );
                        tokio::time::sleep(delay).await;
                    }
                },
            }
        }

        info!(consumer = %self.config.consumer, "persistence worker stopped");
    }
}
