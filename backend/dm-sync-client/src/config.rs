use std::time::Duration;

use resilience::BackoffPolicy;

/// Per-conversation tuning for the synchronization engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Messages per history request
    pub page_size: i64,
    /// How long push events sit in the reorder buffer before being merged
    pub reorder_delay: Duration,
    /// Max distance between a token-less persisted event and a local placeholder
    /// for the two to be treated as the same message
    pub heuristic_window: Duration,
    /// A push send with neither ack nor persisted event after this long is failed
    pub ack_timeout: Duration,
    /// Period of the outbox retry timer
    pub outbox_tick: Duration,
    /// Per-item retry delay
    pub outbox_backoff: BackoffPolicy,
    /// Delay between push reconnect attempts
    pub reconnect_backoff: BackoffPolicy,
    /// Report delivered receipts for incoming messages while online
    pub report_delivered: bool,
    pub max_body_bytes: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            reorder_delay: Duration::from_millis(150),
            heuristic_window: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(10),
            outbox_tick: Duration::from_secs(5),
            outbox_backoff: resilience::presets::outbox_backoff(),
            reconnect_backoff: resilience::presets::reconnect_backoff(),
            report_delivered: true,
            max_body_bytes: event_schema::MAX_BODY_BYTES,
        }
    }
}
