use event_schema::FanoutEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::registry::ConnectionRegistry;
use crate::broker::Broker;

/// Relay frames published by other gateway instances and by persistence workers
/// to this instance's connections. Frames this instance published itself were
/// already delivered locally and are skipped.
pub async fn run_fanout_listener(
    broker: Arc<dyn Broker>,
    registry: ConnectionRegistry,
    instance_id: String,
    batch_size: usize,
    block: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let backoff = resilience::presets::reconnect_backoff();
    let mut failures = 0u32;

    // Start at the current tail; anything older is history the clients backfill
    let mut last_id = loop {
        if *shutdown.borrow() {
            return;
        }
        match broker.fanout_tail().await {
            Ok(id) => break id,
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = backoff.delay_for(failures);
                error!(error = %e, ?delay, "fanout tail lookup failed");
                tokio::time::sleep(delay).await;
            }
        }
    };
    failures = 0;
    info!(%instance_id, start = %last_id, "fanout listener started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => {}
            result = broker.read_fanout(&last_id, batch_size, block) => match result {
                Ok(entries) => {
                    failures = 0;
                    for entry in entries {
                        last_id = entry.id.clone();
                        match FanoutEvent::from_fields(&entry.fields) {
                            Ok(event) if event.origin == instance_id => {}
                            Ok(event) => deliver(&registry, event).await,
                            Err(e) => {
                                warn!(entry_id = %entry.id, error = %e, "undecodable fanout entry")
                            }
                        }
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = backoff.delay_for(failures);
                    error!(error = %e, ?delay, "fanout read failed");
                    tokio::time::sleep(delay).await;
                }
            },
        }
    }

    info!(%instance_id, "fanout listener stopped");
}

async fn deliver(registry: &ConnectionRegistry, event: FanoutEvent) {
    let thread_id = event.frame.thread_id();
    match event.frame.to_json() {
        Ok(json) => {
            let reached = registry.broadcast(thread_id, json).await;
            debug!(
                %thread_id,
                kind = event.frame.event_type(),
                origin = %event.origin,
                reached,
                "fanout frame relayed"
            );
        }
        Err(e) => error!(%thread_id, error = %e, "frame serialization failed"),
    }
}
