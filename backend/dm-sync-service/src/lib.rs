pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod redis_client;
pub mod routes;
pub mod state;
pub mod store;
pub mod worker;
