use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, RedisResult};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared Redis handle.
///
/// Non-blocking commands go through the auto-reconnecting manager. Blocking reads
/// (XREAD/XREADGROUP with BLOCK) need a connection of their own, otherwise they
/// stall every command queued behind them.
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    manager: Arc<Mutex<ConnectionManager>>,
}

impl RedisClient {
    pub async fn from_url(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            manager: Arc::new(Mutex::new(manager)),
        })
    }

    pub async fn get_multiplexed_async_connection(&self) -> RedisResult<ConnectionManager> {
        let guard = self.manager.lock().await;
        Ok(guard.clone())
    }

    /// Fresh connection for one blocking reader
    pub async fn dedicated_connection(&self) -> RedisResult<MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await
    }
}
