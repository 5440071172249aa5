use actix_web::{web, App, HttpServer};
use dm_sync_service::{
    broker::{Broker, RedisStreamsBroker},
    config, db,
    error::AppError,
    gateway, logging,
    middleware::JwtVerifier,
    redis_client::RedisClient,
    routes,
    state::AppState,
    store::{MessageStore, PgMessageStore},
    worker,
};
use resilience::{presets, with_retry};
use std::sync::Arc;
use tokio::sync::watch;

#[actix_web::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let pool = with_retry(presets::startup_connect(), || db::init_pool(&cfg))
        .await
        .map_err(|e| AppError::StartServer(format!("db: {e}")))?;
    db::run_migrations(&pool)
        .await
        .map_err(|e| AppError::StartServer(format!("migrations: {e}")))?;

    let redis = with_retry(presets::startup_connect(), || RedisClient::from_url(&cfg.redis_url))
        .await
        .map_err(|e| AppError::StartServer(format!("redis: {e}")))?;

    let store: Arc<dyn MessageStore> = Arc::new(PgMessageStore::new(pool));
    let broker: Arc<dyn Broker> = Arc::new(RedisStreamsBroker::new(redis, cfg.streams.clone()));
    broker
        .ensure_group()
        .await
        .map_err(|e| AppError::StartServer(format!("consumer group: {e}")))?;

    let jwt = JwtVerifier::from_key(&cfg.jwt_key)?;
    let state = AppState::new(store.clone(), broker.clone(), jwt, cfg.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let fanout = tokio::spawn(gateway::run_fanout_listener(
        broker.clone(),
        state.registry.clone(),
        cfg.instance_id.clone(),
        cfg.streams.batch_size,
        cfg.streams.block,
        shutdown_rx.clone(),
    ));

    let workers = if cfg.embedded_worker {
        tracing::info!(workers = cfg.worker_concurrency, "running embedded persistence workers");
        worker::spawn_worker_pool(store.clone(), broker.clone(), &cfg, shutdown_rx.clone())
    } else {
        Vec::new()
    };

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, instance_id = %cfg.instance_id, "starting dm-sync-service");

    // Runs until SIGINT/SIGTERM; actix handles the signals
    let result = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure_routes)
    })
    .bind(&bind_addr)
    .map_err(|e| AppError::StartServer(format!("bind REST: {e}")))?
    .run()
    .await;

    let _ = shutdown_tx.send(true);
    let _ = fanout.await;
    for handle in workers {
        let _ = handle.await;
    }
    tracing::info!("dm-sync-service stopped");

    result.map_err(|e| AppError::StartServer(format!("REST server: {e}")))
}
