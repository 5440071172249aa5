/// Retry and backoff primitives shared by the DM sync service and its clients
///
/// - **Backoff**: exponential delay with cap and optional ±30% jitter, computed
///   from an attempt number so callers can persist only the attempt count
/// - **Retry**: run an async operation until it succeeds, gives a permanent
///   error, or exhausts its attempts
/// - **Presets**: tuned policies for startup connections, the client outbox and
///   push-channel reconnects
///
/// # Example: connect to Postgres at startup
///
/// ```rust,no_run
/// use resilience::{presets, with_retry};
///
/// #[tokio::main]
/// async fn main() {
///     let result = with_retry(presets::startup_connect(), || async {
///         // Your connection attempt here
///         Ok::<_, String>(())
///     })
///     .await;
/// }
/// ```
pub mod backoff;
pub mod presets;
pub mod retry;

pub use backoff::BackoffPolicy;
pub use retry::{with_retry, with_retry_if, RetryConfig, RetryError};
