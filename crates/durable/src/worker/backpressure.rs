//! Backpressure for dispatchers
//!
//! A dispatcher only leases new work while its in-flight count is below the
//! high watermark, and resumes once it drains to the low watermark.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Backpressure configuration
///
/// Watermarks are ratios of the dispatcher's maximum concurrency.
///
/// # Example
///
/// ```
/// use taskhub_durable::worker::BackpressureConfig;
///
/// let config = BackpressureConfig::default()
///     .with_high_watermark(0.85)
///     .with_low_watermark(0.65);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackpressureConfig {
    /// Stop leasing when in-flight work reaches this ratio
    pub high_watermark: f64,

    /// Resume leasing when in-flight work drops to this ratio
    pub low_watermark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_watermark: 0.9,
            low_watermark: 0.7,
        }
    }
}

impl BackpressureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the high watermark (when to stop leasing)
    pub fn with_high_watermark(mut self, watermark: f64) -> Self {
        self.high_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    /// Set the low watermark (when to resume leasing)
    pub fn with_low_watermark(mut self, watermark: f64) -> Self {
        self.low_watermark = watermark.clamp(0.0, 1.0);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), BackpressureError> {
        if self.low_watermark >= self.high_watermark {
            return Err(BackpressureError::InvalidConfig(
                "low_watermark must be less than high_watermark".into(),
            ));
        }
        Ok(())
    }
}

/// Backpressure-related errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackpressureError {
    #[error("invalid backpressure configuration: {0}")]
    InvalidConfig(String),
}

/// In-flight work tracking for one dispatcher
///
/// Uses hysteresis between the two watermarks so the dispatcher does not
/// flap between leasing and pausing.
pub struct BackpressureState {
    config: BackpressureConfig,
    in_flight: AtomicUsize,
    max_concurrency: usize,
    accepting: AtomicBool,
    reason: RwLock<Option<String>>,
}

impl BackpressureState {
    pub fn new(config: BackpressureConfig, max_concurrency: usize) -> Self {
        Self {
            config,
            in_flight: AtomicUsize::new(0),
            max_concurrency: max_concurrency.max(1),
            accepting: AtomicBool::new(true),
            reason: RwLock::new(None),
        }
    }

    /// Check if the dispatcher should lease more work
    pub fn should_accept(&self) -> bool {
        let ratio = self.load_ratio();

        if self.accepting.load(Ordering::Relaxed) {
            if ratio >= self.config.high_watermark {
                self.accepting.store(false, Ordering::Relaxed);
                *self.reason.write() = Some(format!(
                    "load ratio {:.1}% exceeds high watermark",
                    ratio * 100.0
                ));
                return false;
            }
            true
        } else {
            if ratio <= self.config.low_watermark {
                self.accepting.store(true, Ordering::Relaxed);
                *self.reason.write() = None;
                return true;
            }
            false
        }
    }

    /// Record a leased work item; the load drops when the guard is dropped
    pub fn track(self: &Arc<Self>) -> LoadGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        LoadGuard {
            state: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// In-flight work as a ratio of max concurrency
    pub fn load_ratio(&self) -> f64 {
        self.in_flight() as f64 / self.max_concurrency as f64
    }

    /// Slots left before max concurrency
    pub fn available_slots(&self) -> usize {
        self.max_concurrency.saturating_sub(self.in_flight())
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    /// Why leasing is paused, if it is
    pub fn backpressure_reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Stop leasing regardless of load
    pub fn pause(&self, reason: &str) {
        self.accepting.store(false, Ordering::Relaxed);
        *self.reason.write() = Some(reason.to_string());
    }

    /// Resume leasing if load is at or below the low watermark
    pub fn resume(&self) {
        if self.load_ratio() <= self.config.low_watermark {
            self.accepting.store(true, Ordering::Relaxed);
            *self.reason.write() = None;
        }
    }
}

/// One unit of in-flight work
pub struct LoadGuard {
    state: Arc<BackpressureState>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
