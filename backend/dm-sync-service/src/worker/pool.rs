use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{PersistenceWorker, WorkerConfig};
use crate::broker::Broker;
use crate::config::Config;
use crate::store::MessageStore;

/// Start `worker_concurrency` workers sharing one consumer group. Any worker may
/// take any entry; there is no per-thread affinity.
pub fn spawn_worker_pool(
    store: Arc<dyn MessageStore>,
    broker: Arc<dyn Broker>,
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..config.worker_concurrency)
        .map(|index| {
            let worker = PersistenceWorker::new(
                store.clone(),
                broker.clone(),
                WorkerConfig::from_config(config, index),
            );
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}
