use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// How bearer tokens are verified
#[derive(Clone)]
pub enum JwtKey {
    /// HS256 shared secret
    Secret(String),
    /// RS256 public key in PEM form
    RsaPublicPem(String),
}

impl std::fmt::Debug for JwtKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JwtKey::Secret(_) => f.write_str("JwtKey::Secret([REDACTED])"),
            JwtKey::RsaPublicPem(_) => f.write_str("JwtKey::RsaPublicPem"),
        }
    }
}

/// Redis Streams layout and consumer-group tuning
#[derive(Debug, Clone)]
pub struct StreamsConfig {
    /// Send events waiting for persistence
    pub ingest_stream: String,
    /// Server frames relayed between gateway instances
    pub fanout_stream: String,
    /// Entries that could not be persisted
    pub dead_letter_stream: String,
    /// Consumer group shared by all persistence workers
    pub group_name: String,
    /// Consumer name prefix (instance ID); workers append their index
    pub consumer_name: String,
    /// Batch size for reading messages
    pub batch_size: usize,
    /// How long one XREADGROUP blocks
    pub block: Duration,
    /// Pending entries idle for this long are claimed by another consumer
    pub claim_idle: Duration,
    /// Deliveries after which an entry is dead-lettered
    pub max_deliveries: u64,
    /// Approximate MAXLEN for every stream
    pub max_len: usize,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            ingest_stream: "stream:dm:ingest".to_string(),
            fanout_stream: "stream:dm:fanout".to_string(),
            dead_letter_stream: "stream:dm:dead-letter".to_string(),
            group_name: "persistence-workers".to_string(),
            consumer_name: format!("instance-{}", Uuid::new_v4()),
            batch_size: 100,
            block: Duration::from_millis(2000),
            claim_idle: Duration::from_secs(30),
            max_deliveries: 10,
            max_len: 100_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    pub jwt_key: JwtKey,
    pub streams: StreamsConfig,
    pub db: DbSettings,
    /// Persistence workers run by the `persistence-worker` binary
    pub worker_concurrency: usize,
    /// Also run a worker pool inside the gateway process
    pub embedded_worker: bool,
    pub default_page_size: i64,
    pub max_page_size: i64,
    pub max_body_bytes: usize,
    /// Identifies this gateway instance on the fanout stream
    pub instance_id: String,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::Config("DATABASE_URL missing".into()))?;
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let jwt_key = match (env::var("JWT_PUBLIC_KEY_PEM"), env::var("JWT_SECRET")) {
            (Ok(pem), _) if !pem.trim().is_empty() => JwtKey::RsaPublicPem(pem),
            (_, Ok(secret)) if !secret.is_empty() => JwtKey::Secret(secret),
            _ => {
                return Err(AppError::Config(
                    "JWT_PUBLIC_KEY_PEM or JWT_SECRET missing".into(),
                ))
            }
        };

        let defaults = StreamsConfig::default();
        let streams = StreamsConfig {
            ingest_stream: env::var("DM_INGEST_STREAM").unwrap_or(defaults.ingest_stream),
            fanout_stream: env::var("DM_FANOUT_STREAM").unwrap_or(defaults.fanout_stream),
            dead_letter_stream: env::var("DM_DEAD_LETTER_STREAM")
                .unwrap_or(defaults.dead_letter_stream),
            group_name: env::var("DM_CONSUMER_GROUP").unwrap_or(defaults.group_name),
            consumer_name: env::var("DM_CONSUMER_NAME").unwrap_or(defaults.consumer_name),
            batch_size: env_or("DM_BATCH_SIZE", defaults.batch_size),
            block: Duration::from_millis(env_or("DM_BLOCK_MS", 2000)),
            claim_idle: Duration::from_millis(env_or("DM_CLAIM_IDLE_MS", 30_000)),
            max_deliveries: env_or("DM_MAX_DELIVERIES", defaults.max_deliveries),
            max_len: env_or("DM_STREAM_MAX_LEN", defaults.max_len),
        };

        let db = DbSettings {
            max_connections: env_or("DB_MAX_CONNECTIONS", 20),
            min_connections: env_or("DB_MIN_CONNECTIONS", 2),
            acquire_timeout: Duration::from_secs(env_or("DB_ACQUIRE_TIMEOUT_SECS", 10)),
        };

        let default_page_size: i64 = env_or("DM_PAGE_SIZE", 50);
        let max_page_size: i64 = env_or("DM_MAX_PAGE_SIZE", 200);
        if default_page_size <= 0 || default_page_size > max_page_size {
            return Err(AppError::Config(format!(
                "DM_PAGE_SIZE must be in 1..={max_page_size}"
            )));
        }

        Ok(Self {
            database_url,
            redis_url,
            port: env_or("PORT", 8085),
            jwt_key,
            streams,
            db,
            worker_concurrency: env_or("DM_WORKER_CONCURRENCY", 4).max(1),
            embedded_worker: env_or("DM_EMBEDDED_WORKER", false),
            default_page_size,
            max_page_size,
            max_body_bytes: env_or("DM_MAX_BODY_BYTES", event_schema::MAX_BODY_BYTES),
            instance_id: env::var("DM_INSTANCE_ID")
                .unwrap_or_else(|_| format!("gateway-{}", Uuid::new_v4())),
        })
    }

    /// Defaults for in-process tests
    pub fn test_defaults() -> Self {
        Self {
            database_url: "postgres://localhost/dm_sync_test".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            port: 0,
            jwt_key: JwtKey::Secret("test-secret".to_string()),
            streams: StreamsConfig {
                consumer_name: "test-consumer".to_string(),
                block: Duration::from_millis(50),
                claim_idle: Duration::from_millis(500),
                max_deliveries: 5,
                ..StreamsConfig::default()
            },
            db: DbSettings {
                max_connections: 5,
                min_connections: 1,
                acquire_timeout: Duration::from_secs(5),
            },
            worker_concurrency: 1,
            embedded_worker: false,
            default_page_size: 50,
            max_page_size: 200,
            max_body_bytes: event_schema::MAX_BODY_BYTES,
            instance_id: "gateway-test".to_string(),
        }
    }
}
