//! Task hub worker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reliability::{duration_millis, RetryPolicy};
use crate::worker::{BackpressureConfig, PollerConfig};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration shared by the dispatchers and the timer service
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use taskhub_durable::TaskHubConfig;
///
/// let config = TaskHubConfig::default()
///     .with_worker_id("worker-a")
///     .with_lease_duration(Duration::from_secs(60))
///     .with_activity_concurrency(32);
/// assert_eq!(config.worker_id, "worker-a");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskHubConfig {
    /// PostgreSQL connection string; unused by the in-memory store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Unique worker id, recorded as lease owner
    pub worker_id: String,

    /// How long a lease stays valid without renewal
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,

    /// Deliveries after which a work item is treated as poison
    pub max_dequeue_count: u32,

    /// Orchestrator work items processed concurrently
    pub orchestration_concurrency: usize,

    /// Activities executed concurrently
    pub activity_concurrency: usize,

    /// Polling for the orchestrator and activity queues
    pub poller: PollerConfig,

    /// Activity dispatcher backpressure
    pub backpressure: BackpressureConfig,

    /// Interval between timer sweeps
    #[serde(with = "duration_millis")]
    pub timer_sweep_interval: Duration,

    /// Retries for transient storage errors on commit
    pub store_retry: RetryPolicy,

    /// Visibility delay when no orchestrator is registered for an instance
    #[serde(with = "duration_millis")]
    pub unknown_orchestration_delay: Duration,

    /// Time to wait for in-flight work on shutdown
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for TaskHubConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            worker_id: format!("worker-{}", Uuid::now_v7()),
            lease_duration: Duration::from_secs(30),
            max_dequeue_count: 5,
            orchestration_concurrency: 4,
            activity_concurrency: 10,
            poller: PollerConfig::default(),
            backpressure: BackpressureConfig::default(),
            timer_sweep_interval: Duration::from_millis(500),
            store_retry: RetryPolicy::exponential()
                .with_initial_interval(Duration::from_millis(100))
                .with_max_interval(Duration::from_secs(5)),
            unknown_orchestration_delay: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl TaskHubConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: PostgreSQL connection string
    /// - `WORKER_ID`: worker id (default: `worker-<uuid>`)
    /// - `LEASE_DURATION_MS`: lease duration in milliseconds (default: 30000)
    /// - `MAX_DEQUEUE_COUNT`: poison threshold (default: 5)
    /// - `ORCHESTRATION_CONCURRENCY`: orchestrator items in flight (default: 4)
    /// - `ACTIVITY_CONCURRENCY`: activities in flight (default: 10)
    /// - `POLL_MIN_INTERVAL_MS` / `POLL_MAX_INTERVAL_MS`: poll backoff bounds
    /// - `STORE_RETRY_MAX_ATTEMPTS`: attempts for transient store errors (default: 5)
    /// - `STORE_RETRY_BACKOFF_COEFFICIENT`: store retry growth factor, at least 1.0 (default: 2.0)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut config = Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            worker_id: std::env::var("WORKER_ID").unwrap_or_else(|_| defaults.worker_id.clone()),
            lease_duration: env_millis("LEASE_DURATION_MS").unwrap_or(defaults.lease_duration),
            max_dequeue_count: env_parse("MAX_DEQUEUE_COUNT").unwrap_or(defaults.max_dequeue_count),
            orchestration_concurrency: env_parse("ORCHESTRATION_CONCURRENCY")
                .unwrap_or(defaults.orchestration_concurrency),
            activity_concurrency: env_parse("ACTIVITY_CONCURRENCY")
                .unwrap_or(defaults.activity_concurrency),
            ..defaults
        };

        if let Some(interval) = env_millis("POLL_MIN_INTERVAL_MS") {
            config.poller = config.poller.with_min_interval(interval);
        }
        if let Some(interval) = env_millis("POLL_MAX_INTERVAL_MS") {
            config.poller = config.poller.with_max_interval(interval);
        }
        if let Some(attempts) = env_parse::<u32>("STORE_RETRY_MAX_ATTEMPTS") {
            config.store_retry = config.store_retry.with_max_attempts(attempts.max(1));
        }
        if let Some(coefficient) = env_parse::<f64>("STORE_RETRY_BACKOFF_COEFFICIENT") {
            config.store_retry = config.store_retry.with_backoff_coefficient(coefficient);
        }
        config
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    pub fn with_max_dequeue_count(mut self, count: u32) -> Self {
        self.max_dequeue_count = count.max(1);
        self
    }

    pub fn with_orchestration_concurrency(mut self, max: usize) -> Self {
        self.orchestration_concurrency = max.max(1);
        self
    }

    pub fn with_activity_concurrency(mut self, max: usize) -> Self {
        self.activity_concurrency = max.max(1);
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_backpressure(mut self, config: BackpressureConfig) -> Self {
        self.backpressure = config;
        self
    }

    pub fn with_timer_sweep_interval(mut self, interval: Duration) -> Self {
        self.timer_sweep_interval = interval;
        self
    }

    pub fn with_store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }

    pub fn with_unknown_orchestration_delay(mut self, delay: Duration) -> Self {
        self.unknown_orchestration_delay = delay;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TaskHubConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert_eq!(config.max_dequeue_count, 5);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = TaskHubConfig::new()
            .with_worker_id("worker-a")
            .with_max_dequeue_count(0)
            .with_activity_concurrency(0)
            .with_timer_sweep_interval(Duration::from_millis(50));

        assert_eq!(config.worker_id, "worker-a");
        assert_eq!(config.max_dequeue_count, 1);
        assert_eq!(config.activity_concurrency, 1);
        assert_eq!(config.timer_sweep_interval, Duration::from_millis(50));
    }

    #[test]
    fn test_from_env_clamps_store_retry_coefficient() {
        std::env::set_var("STORE_RETRY_BACKOFF_COEFFICIENT", "-4");
        std::env::set_var("STORE_RETRY_MAX_ATTEMPTS", "3");
        let config = TaskHubConfig::from_env();
        std::env::remove_var("STORE_RETRY_BACKOFF_COEFFICIENT");
        std::env::remove_var("STORE_RETRY_MAX_ATTEMPTS");

        assert_eq!(config.store_retry.backoff_coefficient, 1.0);
        assert_eq!(config.store_retry.max_attempts, 3);
        assert_eq!(config.store_retry.backoff(3), Duration::from_millis(100));
    }

    #[test]
    fn test_config_serializes_durations_as_millis() {
        let config = TaskHubConfig::new().with_lease_duration(Duration::from_secs(2));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["lease_duration"], 2000);

        let parsed: TaskHubConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
