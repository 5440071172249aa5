//! Redis Streams broker
//!
//! Ingest: XADD with approximate MAXLEN, XREADGROUP per worker, XACK on success,
//! XPENDING + XCLAIM to recover entries from crashed workers. Fanout: plain XREAD.

use async_trait::async_trait;
use event_schema::{EventEnvelope, FanoutEvent, MessageSendEvent};
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamRangeReply,
    StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, RedisResult};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Broker, BrokerError, BrokerResult, StreamEntry, STREAM_START};
use crate::config::StreamsConfig;
use crate::redis_client::RedisClient;

const FANOUT_READER: &str = "__fanout";

pub struct RedisStreamsBroker {
    client: RedisClient,
    config: StreamsConfig,
    /// One connection per blocking reader, keyed by consumer name
    blocking: Mutex<HashMap<String, MultiplexedConnection>>,
}

impl RedisStreamsBroker {
    pub fn new(client: RedisClient, config: StreamsConfig) -> Self {
        Self {
            client,
            config,
            blocking: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StreamsConfig {
        &self.config
    }

    async fn blocking_connection(&self, reader: &str) -> BrokerResult<MultiplexedConnection> {
        let mut conns = self.blocking.lock().await;
        if let Some(conn) = conns.get(reader) {
            return Ok(conn.clone());
        }
        let conn = self.client.dedicated_connection().await?;
        conns.insert(reader.to_string(), conn.clone());
        Ok(conn)
    }

    /// Drop a reader's connection so the next call reconnects
    async fn discard_connection(&self, reader: &str) {
        self.blocking.lock().await.remove(reader);
    }

    fn read_options(count: usize, block: Duration) -> StreamReadOptions {
        let opts = StreamReadOptions::default().count(count);
        // BLOCK 0 waits forever
        match block.as_millis() {
            0 => opts,
            ms => opts.block(ms as usize),
        }
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(&'static str, String)],
    ) -> BrokerResult<String> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let id: String = conn
            .xadd_maxlen(stream, StreamMaxlen::Approx(self.config.max_len), "*", fields)
            .await?;
        Ok(id)
    }
}

fn to_entry(raw: StreamId, deliveries: u64) -> StreamEntry {
    let fields = raw
        .map
        .iter()
        .filter_map(|(k, v)| {
            redis::from_redis_value::<String>(v)
                .ok()
                .map(|s| (k.clone(), s))
        })
        .collect();
    StreamEntry {
        id: raw.id,
        fields,
        deliveries,
    }
}

fn flatten(reply: Option<StreamReadReply>) -> Vec<StreamId> {
    reply
        .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
        .unwrap_or_default()
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    async fn ensure_group(&self) -> BrokerResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let created: RedisResult<()> = conn
            .xgroup_create_mkstream(&self.config.ingest_stream, &self.config.group_name, "0")
            .await;
        match created {
            Ok(()) => {
                info!(
                    stream = %self.config.ingest_stream,
                    group = %self.config.group_name,
                    "consumer group created"
                );
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn enqueue_send(
        &self,
        envelope: &EventEnvelope<MessageSendEvent>,
    ) -> BrokerResult<String> {
        let fields = MessageSendEvent::to_fields(envelope)?;
        self.append(&self.config.ingest_stream, &fields).await
    }

    async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let mut conn = self.blocking_connection(consumer).await?;
        let opts = Self::read_options(count, block).group(&self.config.group_name, consumer);
        let reply: RedisResult<Option<StreamReadReply>> = conn
            .xread_options(&[self.config.ingest_stream.as_str()], &[">"], &opts)
            .await;

        match reply {
            Ok(reply) => Ok(flatten(reply)
                .into_iter()
                .map(|raw| to_entry(raw, 1))
                .collect()),
            Err(e) if e.code() == Some("NOGROUP") => {
                // Stream or group deleted underneath us
                warn!(consumer, "consumer group missing, recreating");
                self.ensure_group().await?;
                Ok(Vec::new())
            }
            Err(e) => {
                self.discard_connection(consumer).await;
                Err(e.into())
            }
        }
    }

    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let pending: StreamPendingCountReply = conn
            .xpending_count(
                &self.config.ingest_stream,
                &self.config.group_name,
                "-",
                "+",
                count,
            )
            .await?;

        let min_idle_ms = min_idle.as_millis() as usize;
        let stale: HashMap<String, u64> = pending
            .ids
            .iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .map(|p| (p.id.clone(), p.times_delivered as u64))
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = stale.keys().map(String::as_str).collect();
        let claimed: StreamClaimReply = conn
            .xclaim(
                &self.config.ingest_stream,
                &self.config.group_name,
                consumer,
                min_idle_ms,
                ids.as_slice(),
            )
            .await?;

        debug!(consumer, claimed = claimed.ids.len(), "claimed stale entries");
        Ok(claimed
            .ids
            .into_iter()
            .map(|raw| {
                // XCLAIM counts as one more delivery
                let deliveries = stale.get(&raw.id).copied().unwrap_or(0) + 1;
                to_entry(raw, deliveries)
            })
            .collect())
    }

    async fn ack(&self, entry_id: &str) -> BrokerResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = conn
            .xack(
                &self.config.ingest_stream,
                &self.config.group_name,
                &[entry_id],
            )
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, entry: &StreamEntry, reason: &str) -> BrokerResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut fields: Vec<(String, String)> = entry
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        fields.push(("source_entry".to_string(), entry.id.clone()));
        fields.push(("reason".to_string(), reason.to_string()));
        fields.push(("deliveries".to_string(), entry.deliveries.to_string()));

        let _: String = conn
            .xadd_maxlen(
                &self.config.dead_letter_stream,
                StreamMaxlen::Approx(self.config.max_len),
                "*",
                fields.as_slice(),
            )
            .await?;
        Ok(())
    }

    async fn publish_fanout(&self, event: &FanoutEvent) -> BrokerResult<String> {
        let fields = event.to_fields()?;
        self.append(&self.config.fanout_stream, &fields).await
    }

    async fn fanout_tail(&self) -> BrokerResult<String> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let newest: StreamRangeReply = conn
            .xrevrange_count(&self.config.fanout_stream, "+", "-", 1)
            .await?;
        Ok(newest
            .ids
            .into_iter()
            .next()
            .map(|raw| raw.id)
            .unwrap_or_else(|| STREAM_START.to_string()))
    }

    async fn read_fanout(
        &self,
        last_id: &str,
        count: usize,
        block: Duration,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let mut conn = self.blocking_connection(FANOUT_READER).await?;
        let opts = Self::read_options(count, block);
        let reply: RedisResult<Option<StreamReadReply>> = conn
            .xread_options(&[self.config.fanout_stream.as_str()], &[last_id], &opts)
            .await;

        match reply {
            Ok(reply) => Ok(flatten(reply)
                .into_iter()
                .map(|raw| to_entry(raw, 1))
                .collect()),
            Err(e) => {
                self.discard_connection(FANOUT_READER).await;
                Err(BrokerError::from(e))
            }
        }
    }
}
