use async_trait::async_trait;
use event_schema::{EventEnvelope, FanoutEvent, MessageSendEvent};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{Broker, BrokerError, BrokerResult, StreamEntry, STREAM_START};
use crate::config::StreamsConfig;

struct Pending {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    ingest: Vec<(u64, HashMap<String, String>)>,
    /// Index into `ingest` of the first entry never handed to the group
    group_cursor: usize,
    pending: BTreeMap<u64, Pending>,
    dead_letters: Vec<StreamEntry>,
    fanout: Vec<(u64, HashMap<String, String>)>,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Drop ingest entries the group has seen and nobody still owns
    fn trim_acked(&mut self) {
        let delivered = self.group_cursor.min(self.ingest.len());
        let pending = &self.pending;
        let still_owned = self.ingest[..delivered]
            .iter()
            .filter(|(seq, _)| pending.contains_key(seq))
            .count();
        let mut index = 0;
        self.ingest.retain(|(seq, _)| {
            let keep = index >= delivered || pending.contains_key(seq);
            index += 1;
            keep
        });
        self.group_cursor = still_owned;
    }

    /// Oldest-first cap, like MAXLEN on a Redis stream
    fn cap_ingest(&mut self, max_len: usize) {
        let excess = self.ingest.len().saturating_sub(max_len);
        if excess > 0 {
            self.ingest.drain(..excess);
            self.group_cursor = self.group_cursor.saturating_sub(excess);
        }
    }

    fn cap_fanout(&mut self, max_len: usize) {
        let excess = self.fanout.len().saturating_sub(max_len);
        if excess > 0 {
            self.fanout.drain(..excess);
        }
    }
}

fn entry_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_seq(id: &str) -> BrokerResult<u64> {
    id.split('-')
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| BrokerError::Unavailable(format!("malformed entry id {id}")))
}

fn into_map(fields: Vec<(&'static str, String)>) -> HashMap<String, String> {
    fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Single-process broker with consumer-group semantics: pending entries,
/// delivery counts and idle-based claiming. Acked entries are dropped and both
/// streams are capped at `max_len`.
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    ingest_ready: Notify,
    fanout_ready: Notify,
    unavailable: AtomicBool,
    max_len: usize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::with_max_len(StreamsConfig::default().max_len)
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ingest_ready: Notify::new(),
            fanout_ready: Notify::new(),
            unavailable: AtomicBool::new(false),
            max_len: max_len.max(1),
        }
    }

    /// Simulate an outage of the ingest path
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Entries currently owned by `consumer`
    pub async fn pending_for(&self, consumer: &str) -> usize {
        self.inner
            .lock()
            .await
            .pending
            .values()
            .filter(|p| p.consumer == consumer)
            .count()
    }

    pub async fn dead_letters(&self) -> Vec<StreamEntry> {
        self.inner.lock().await.dead_letters.clone()
    }

    /// Entries still held by the ingest stream, unread or unacked
    pub async fn ingest_len(&self) -> usize {
        self.inner.lock().await.ingest.len()
    }

    pub async fn fanout_len(&self) -> usize {
        self.inner.lock().await.fanout.len()
    }

    /// Append raw fields to the ingest stream, bypassing encoding
    pub async fn push_raw(&self, fields: HashMap<String, String>) -> String {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_id();
        inner.ingest.push((seq, fields));
        inner.cap_ingest(self.max_len);
        drop(inner);
        self.ingest_ready.notify_waiters();
        entry_id(seq)
    }

    fn check(&self) -> BrokerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("memory broker offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ensure_group(&self) -> BrokerResult<()> {
        self.check()
    }

    async fn enqueue_send(
        &self,
        envelope: &EventEnvelope<MessageSendEvent>,
    ) -> BrokerResult<String> {
        self.check()?;
        let fields = into_map(MessageSendEvent::to_fields(envelope)?);
        Ok(self.push_raw(fields).await)
    }

    async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            self.check()?;
            let notified = self.ingest_ready.notified();
            {
                let mut inner = self.inner.lock().await;
                let start = inner.group_cursor;
                let end = (start + count).min(inner.ingest.len());
                if end > start {
                    let batch: Vec<(u64, HashMap<String, String>)> =
                        inner.ingest[start..end].to_vec();
                    inner.group_cursor = end;
                    let now = Instant::now();
                    let mut out = Vec::with_capacity(batch.len());
                    for (seq, fields) in batch {
                        inner.pending.insert(
                            seq,
                            Pending {
                                consumer: consumer.to_string(),
                                delivered_at: now,
                                deliveries: 1,
                            },
                        );
                        out.push(StreamEntry {
                            id: entry_id(seq),
                            fields,
                            deliveries: 1,
                        });
                    }
                    return Ok(out);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> BrokerResult<Vec<StreamEntry>> {
        self.check()?;
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let stale: Vec<u64> = inner
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(seq, _)| *seq)
            .take(count)
            .collect();

        let mut out = Vec::with_capacity(stale.len());
        for seq in stale {
            let fields = inner
                .ingest
                .iter()
                .find(|(s, _)| *s == seq)
                .map(|(_, f)| f.clone())
                .unwrap_or_default();
            if let Some(p) = inner.pending.get_mut(&seq) {
                p.consumer = consumer.to_string();
                p.delivered_at = now;
                p.deliveries += 1;
                out.push(StreamEntry {
                    id: entry_id(seq),
                    fields,
                    deliveries: p.deliveries,
                });
            }
        }
        Ok(out)
    }

    async fn ack(&self, entry_id: &str) -> BrokerResult<()> {
        let seq = parse_seq(entry_id)?;
        let mut inner = self.inner.lock().await;
        if inner.pending.remove(&seq).is_some() {
            inner.trim_acked();
        }
        Ok(())
    }

    async fn dead_letter(&self, entry: &StreamEntry, reason: &str) -> BrokerResult<()> {
        let mut fields = entry.fields.clone();
        fields.insert("reason".to_string(), reason.to_string());
        fields.insert("source_entry".to_string(), entry.id.clone());
        self.inner.lock().await.dead_letters.push(StreamEntry {
            id: entry.id.clone(),
            fields,
            deliveries: entry.deliveries,
        });
        Ok(())
    }

    async fn publish_fanout(&self, event: &FanoutEvent) -> BrokerResult<String> {
        let fields = into_map(event.to_fields()?);
        let mut inner = self.inner.lock().await;
        let seq = inner.next_id();
        inner.fanout.push((seq, fields));
        inner.cap_fanout(self.max_len);
        drop(inner);
        self.fanout_ready.notify_waiters();
        Ok(entry_id(seq))
    }

    async fn fanout_tail(&self) -> BrokerResult<String> {
        let inner = self.inner.lock().await;
        Ok(inner
            .fanout
            .last()
            .map(|(seq, _)| entry_id(*seq))
            .unwrap_or_else(|| STREAM_START.to_string()))
    }

    async fn read_fanout(
        &self,
        last_id: &str,
        count: usize,
        block: Duration,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let after = parse_seq(last_id)?;
        let deadline = Instant::now() + block;
        loop {
            let notified = self.fanout_ready.notified();
            {
                let inner = self.inner.lock().await;
                let out: Vec<StreamEntry> = inner
                    .fanout
                    .iter()
                    .filter(|(seq, _)| *seq > after)
                    .take(count)
                    .map(|(seq, fields)| StreamEntry {
                        id: entry_id(*seq),
                        fields: fields.clone(),
                        deliveries: 1,
                    })
                    .collect();
                if !out.is_empty() {
                    return Ok(out);
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}
