use std::sync::Arc;

use crate::broker::Broker;
use crate::config::Config;
use crate::gateway::{ConnectionRegistry, IngressGateway};
use crate::middleware::JwtVerifier;
use crate::store::MessageStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub broker: Arc<dyn Broker>,
    pub registry: ConnectionRegistry,
    pub gateway: IngressGateway,
    pub jwt: JwtVerifier,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn MessageStore>,
        broker: Arc<dyn Broker>,
        jwt: JwtVerifier,
        config: Arc<Config>,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        let gateway = IngressGateway::new(
            store.clone(),
            broker.clone(),
            registry.clone(),
            config.instance_id.clone(),
            config.max_body_bytes,
        );
        Self {
            store,
            broker,
            registry,
            gateway,
            jwt,
            config,
        }
    }

    /// Clamp a requested page size into `1..=max_page_size`
    pub fn page_size(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.config.default_page_size)
            .clamp(1, self.config.max_page_size)
    }
}
