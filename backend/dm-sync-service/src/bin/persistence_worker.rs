//! Standalone persistence worker pool. Scales independently of the gateways;
//! every process joins the same consumer group.

use anyhow::{anyhow, Context};
use dm_sync_service::{
    broker::{Broker, RedisStreamsBroker},
    config, db, logging,
    redis_client::RedisClient,
    store::{MessageStore, PgMessageStore},
    worker,
};
use resilience::{presets, with_retry};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let cfg = config::Config::from_env()?;

    let pool = with_retry(presets::startup_connect(), || db::init_pool(&cfg))
        .await
        .map_err(|e| anyhow!("db: {e}"))?;
    let redis = with_retry(presets::startup_connect(), || RedisClient::from_url(&cfg.redis_url))
        .await
        .map_err(|e| anyhow!("redis: {e}"))?;

    let store: Arc<dyn MessageStore> = Arc::new(PgMessageStore::new(pool));
    let broker: Arc<dyn Broker> = Arc::new(RedisStreamsBroker::new(redis, cfg.streams.clone()));
    broker
        .ensure_group()
        .await
        .context("failed to create consumer group")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = worker::spawn_worker_pool(store, broker, &cfg, shutdown_rx);
    tracing::info!(
        workers = handles.len(),
        group = %cfg.streams.group_name,
        "persistence worker pool running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to install signal handler")?;
    tracing::info!("shutdown requested, draining workers");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "worker task panicked");
        }
    }
    Ok(())
}
