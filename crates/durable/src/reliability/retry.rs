//! Retry policies for activities and store calls

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::persistence::StoreError;

/// How often and how far apart to retry
///
/// Orchestrator code passes a policy to `schedule_activity_with_retry`;
/// there the backoff becomes a durable timer, so it is computed with
/// [`RetryPolicy::backoff`] and never jittered. The dispatchers reuse the
/// same type for transient store errors, where [`RetryPolicy::jittered_backoff`]
/// spreads out concurrent workers.
///
/// # Example
///
/// ```
/// use taskhub_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(4)
///     .with_initial_interval(Duration::from_secs(2))
///     .with_non_retryable_error("Validation");
///
/// assert_eq!(policy.backoff(2), Duration::from_secs(2));
/// assert_eq!(policy.backoff(3), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included
    pub max_attempts: u32,

    /// Backoff before the second attempt
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound for any single backoff
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor between consecutive backoffs
    pub backoff_coefficient: f64,

    /// Random spread (0.0-1.0) applied by `jittered_backoff` only
    pub jitter: f64,

    /// Failure types that end the retry loop immediately
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Doubling backoff: 5 attempts, 1s initial, 60s cap, 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable_errors: Vec::new(),
        }
    }

    /// Constant backoff of `interval` between `max_attempts` attempts
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: Vec::new(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the growth factor; values below 1.0 (or NaN) become 1.0
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = sanitize_coefficient(coefficient);
        self
    }

    /// Set the jitter factor, clamped to 0.0-1.0
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Never retry failures of this type
    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Backoff before `attempt` (1-based); zero for the first attempt
    ///
    /// The same inputs always give the same delay, which replay relies on.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(2).min(i32::MAX as u32) as i32;
        let growth = sanitize_coefficient(self.backoff_coefficient).powi(exponent);
        let secs = (self.initial_interval.as_secs_f64() * growth)
            .min(self.max_interval.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_interval)
    }

    /// `backoff` with up to `jitter` relative spread in either direction
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt).as_secs_f64();
        if self.jitter <= 0.0 || base <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let spread = base * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..spread);
        Duration::from_secs_f64((base + offset).max(0.0))
    }

    /// Check whether a failure of `error_type` after `attempt` gets another try
    pub fn allows_retry(&self, error_type: &str, attempt: u32) -> bool {
        attempt < self.max_attempts && !self.non_retryable_errors.iter().any(|e| e == error_type)
    }
}

// Deserialized policies bypass the builder
fn sanitize_coefficient(coefficient: f64) -> f64 {
    if coefficient >= 1.0 {
        coefficient
    } else {
        1.0
    }
}

/// Run a store call, retrying transient errors per `policy`
///
/// Lease conflicts and other non-transient errors are returned on first
/// sight.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                attempt += 1;
                let delay = policy.jittered_backoff(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Transient store error, retrying: {}",
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
