//! Ordered, replayable event log between the gateway and the persistence workers
//!
//! Two streams are involved. The ingest stream is consumed through a consumer
//! group: every entry stays pending until a worker acknowledges it, and entries
//! left pending too long are claimed by another worker. The fanout stream is read
//! by every gateway instance without a group so each one sees every frame.

pub mod memory;
pub mod redis_streams;

use async_trait::async_trait;
use event_schema::{EventEnvelope, EventError, FanoutEvent, MessageSendEvent};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryBroker;
pub use redis_streams::RedisStreamsBroker;

/// Start position for a fanout reader that has seen nothing yet
pub const STREAM_START: &str = "0-0";

/// One stream entry as handed to a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
    /// How many times this entry has been handed out, including this one
    pub deliveries: u64,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("event encoding error: {0}")]
    Encode(#[from] EventError),

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the ingest consumer group if it does not exist
    async fn ensure_group(&self) -> BrokerResult<()>;

    /// Append a send event to the ingest stream; returns the entry id
    async fn enqueue_send(&self, envelope: &EventEnvelope<MessageSendEvent>)
        -> BrokerResult<String>;

    /// New ingest entries for `consumer`, waiting up to `block` when none are ready
    async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BrokerResult<Vec<StreamEntry>>;

    /// Take over entries that stayed unacknowledged for at least `min_idle`
    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> BrokerResult<Vec<StreamEntry>>;

    async fn ack(&self, entry_id: &str) -> BrokerResult<()>;

    /// Copy an entry to the dead-letter stream. Does not acknowledge it.
    async fn dead_letter(&self, entry: &StreamEntry, reason: &str) -> BrokerResult<()>;

    async fn publish_fanout(&self, event: &FanoutEvent) -> BrokerResult<String>;

    /// Id of the newest fanout entry, or [`STREAM_START`] when the stream is empty
    async fn fanout_tail(&self) -> BrokerResult<String>;

    /// Fanout entries strictly after `last_id`
    async fn read_fanout(
        &self,
        last_id: &str,
        count: usize,
        block: Duration,
    ) -> BrokerResult<Vec<StreamEntry>>;
}
