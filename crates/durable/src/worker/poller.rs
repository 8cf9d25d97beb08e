//! Work item polling with exponential backoff
//!
//! Leases work from one queue, backing off while the queue is empty and
//! snapping back to the minimum interval as soon as work shows up.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::persistence::{QueueKind, StoreError, TaskHubStore, WorkItem};
use crate::reliability::duration_millis;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Poll interval while work is available
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Poll interval ceiling while idle
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when the queue is empty
    pub backoff_multiplier: f64,

    /// Maximum items to lease per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Leases work items from one queue
pub struct WorkPoller {
    store: Arc<dyn TaskHubStore>,
    worker_id: String,
    queue: QueueKind,
    lease_duration: Duration,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkPoller {
    pub fn new(
        store: Arc<dyn TaskHubStore>,
        worker_id: impl Into<String>,
        queue: QueueKind,
        lease_duration: Duration,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            queue,
            lease_duration,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Lease up to `max_items` work items
    ///
    /// Stops at the first empty lease and updates the backoff state.
    #[instrument(skip(self), fields(worker_id = %self.worker_id, queue = %self.queue))]
    pub async fn poll(&mut self, max_items: usize) -> Result<Vec<WorkItem>, PollerError> {
        if self.is_shutdown() {
            debug!("Poller shutdown requested");
            return Ok(vec![]);
        }

        let limit = max_items.min(self.config.batch_size);
        let mut items = Vec::with_capacity(limit);
        while items.len() < limit {
            match self
                .store
                .lease_next(self.queue, &self.worker_id, self.lease_duration)
                .await?
            {
                Some(item) => items.push(item),
                None => break,
            }
        }

        if items.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis() as u64,
                "No work found, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = items.len(), "Leased work items");
        }

        Ok(items)
    }

    /// Wait for the current backoff interval
    ///
    /// Returns `true` if shutdown was signaled while waiting.
    pub async fn wait(&mut self) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}
