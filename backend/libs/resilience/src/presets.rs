/// Preset policies for the DM sync stack
use crate::backoff::BackoffPolicy;
use crate::retry::RetryConfig;
use std::time::Duration;

/// Postgres / Redis connection at process startup
///
/// - 10 retries, 500ms doubling to 10s (about a minute end to end)
pub fn startup_connect() -> RetryConfig {
    RetryConfig {
        max_retries: 10,
        backoff: BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(10)),
    }
}

/// Per-item delay for the client outbox
///
/// - 1s doubling to 5 minutes, jittered so a reconnecting fleet does not retry in lockstep
pub fn outbox_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(300))
}

/// Push-channel reconnects
///
/// - 250ms doubling to 30s
pub fn reconnect_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(250), Duration::from_secs(30))
}

/// Broker read errors inside the persistence worker loop
///
/// - 100ms doubling to 5s, no jitter
pub fn worker_poll_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5)).without_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbox_backoff_caps_at_five_minutes() {
        let policy = outbox_backoff().without_jitter();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(20), Duration::from_secs(300));
    }

    #[test]
    fn test_worker_poll_backoff_is_deterministic() {
        let policy = worker_poll_backoff();
        assert_eq!(policy.delay_for(3), policy.delay_for(3));
        assert_eq!(policy.delay_for(100), Duration::from_secs(5));
    }

    #[test]
    fn test_startup_connect_budget() {
        let config = startup_connect();
        assert_eq!(config.max_retries, 10);
        assert!(config.backoff.jitter);
    }
}
