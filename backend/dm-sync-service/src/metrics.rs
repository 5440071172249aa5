use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

static ACKS_BROADCAST_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "dm_acks_broadcast_total",
        "Fast acknowledgments broadcast to a room",
    )
    .expect("failed to create dm_acks_broadcast_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register dm_acks_broadcast_total");
    counter
});

static SENDS_ENQUEUED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "dm_sends_enqueued_total",
            "Send events handed to the broker, by result",
        ),
        &["result"],
    )
    .expect("failed to create dm_sends_enqueued_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register dm_sends_enqueued_total");
    counter
});

static MESSAGES_PERSISTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "dm_messages_persisted_total",
            "Idempotent inserts, split into new rows and duplicate deliveries",
        ),
        &["outcome"],
    )
    .expect("failed to create dm_messages_persisted_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register dm_messages_persisted_total");
    counter
});

static DEAD_LETTERS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("dm_dead_letters_total", "Entries routed to the dead-letter stream"),
        &["reason"],
    )
    .expect("failed to create dm_dead_letters_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register dm_dead_letters_total");
    counter
});

static WORKER_RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "dm_worker_retries_total",
        "Entries left unacknowledged for redelivery",
    )
    .expect("failed to create dm_worker_retries_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register dm_worker_retries_total");
    counter
});

static ENTRIES_CLAIMED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "dm_entries_claimed_total",
        "Stale pending entries claimed from another consumer",
    )
    .expect("failed to create dm_entries_claimed_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register dm_entries_claimed_total");
    counter
});

static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "dm_active_connections",
        "Open push-channel connections on this instance",
    )
    .expect("failed to create dm_active_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register dm_active_connections");
    gauge
});

pub fn record_ack_broadcast() {
    ACKS_BROADCAST_TOTAL.inc();
}

pub fn record_enqueue(ok: bool) {
    SENDS_ENQUEUED_TOTAL
        .with_label_values(&[if ok { "ok" } else { "error" }])
        .inc();
}

pub fn record_persisted(created: bool) {
    MESSAGES_PERSISTED_TOTAL
        .with_label_values(&[if created { "created" } else { "duplicate" }])
        .inc();
}

pub fn record_dead_letter(reason: &str) {
    DEAD_LETTERS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_worker_retry() {
    WORKER_RETRIES_TOTAL.inc();
}

pub fn record_claimed(count: usize) {
    ENTRIES_CLAIMED_TOTAL.inc_by(count as u64);
}

pub fn connection_opened() {
    ACTIVE_CONNECTIONS.inc();
}

pub fn connection_closed() {
    ACTIVE_CONNECTIONS.dec();
}

pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
