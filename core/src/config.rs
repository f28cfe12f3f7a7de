use crate::util::backoff_with;
use std::thread::available_parallelism;
use std::time::Duration;

/// Tunables for one dispatcher process. Hosts construct this directly;
/// every field has the documented default.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Table namespace inside each store.
    pub table_prefix: String,
    /// Rows claimed per pass.
    pub batch_size: usize,
    /// Row and scope lease duration.
    pub lease_seconds: i64,
    /// Idle sleep for the outbox/inbox loops when a tick found no work.
    pub poll_interval: Duration,
    /// Upper bound on the scheduler sleep between passes.
    pub max_polling_interval: Duration,
    /// How long terminal rows are kept before the sweeper deletes them.
    pub retention_period: Duration,
    /// Cadence of the retention/reap sweeper.
    pub cleanup_interval: Duration,
    /// Transient failures tolerated before a row is failed permanently.
    pub max_attempts: i64,
    /// Consult the configured side-effect probe when taking over an
    /// interrupted attempt's expired lock. Off by default: without a
    /// confirmable side effect a crash between effect and settle means the
    /// handler runs again, and callers must opt in knowingly.
    pub allow_probe: bool,
    /// Handler pool size per loop.
    pub worker_count: usize,
    /// How long a handler's row lease keeps being extended before the
    /// dispatcher signals it to abandon.
    pub max_handler_runtime: Duration,
    pub enable_schema_deployment: bool,
    pub enable_background_workers: bool,
    /// Cadence of store discovery refresh.
    pub discovery_refresh_interval: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            table_prefix: "infra".to_string(),
            batch_size: 50,
            lease_seconds: 30,
            poll_interval: Duration::from_millis(500),
            max_polling_interval: Duration::from_secs(30),
            retention_period: Duration::from_secs(7 * 24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
            max_attempts: 5,
            allow_probe: false,
            worker_count: available_parallelism().map(usize::from).unwrap_or(4),
            max_handler_runtime: Duration::from_secs(600),
            enable_schema_deployment: true,
            enable_background_workers: true,
            discovery_refresh_interval: Duration::from_secs(300),
            retry_base_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(60),
        }
    }
}

impl DispatchConfig {
    /// Backoff before the given retry attempt (1-based).
    pub fn retry_delay(&self, attempt: u64) -> Duration {
        backoff_with(self.retry_base_delay, self.retry_max_delay, attempt)
    }
}
