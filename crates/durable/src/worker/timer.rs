//! Durable timer service
//!
//! Timers live in the store, so they survive worker restarts. Each sweep
//! leases every due timer and delivers a `TimerFired` message to the
//! execution that created it. Delivery and marking the timer fired commit
//! together, so a timer fires at most once per execution.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::orchestration::DispatcherError;
use crate::config::TaskHubConfig;
use crate::history::HistoryEvent;
use crate::persistence::{
    CommitBatch, OrchestratorMessage, QueueKind, TaskHubStore, TimerRequest, TimerWorkItem,
    WorkItem,
};
use crate::reliability::retry_transient;

/// Schedules durable timers and fires them when due
pub struct TimerService {
    store: Arc<dyn TaskHubStore>,
    config: TaskHubConfig,
}

impl TimerService {
    pub fn new(store: Arc<dyn TaskHubStore>, config: TaskHubConfig) -> Self {
        Self { store, config }
    }

    /// Schedule a timer outside an orchestrator commit
    ///
    /// Scheduling the same timer twice is a no-op.
    pub async fn schedule_fire(&self, request: TimerRequest) -> Result<(), DispatcherError> {
        self.store.enqueue_timer(request).await?;
        Ok(())
    }

    /// Fire every due timer; returns how many fired
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn sweep(&self) -> Result<usize, DispatcherError> {
        let mut fired = 0;

        while let Some(leased) = self
            .store
            .lease_next(
                QueueKind::Timer,
                &self.config.worker_id,
                self.config.lease_duration,
            )
            .await?
        {
            let item = match leased {
                WorkItem::Timer(item) => item,
                other => {
                    warn!(kind = %other.kind(), "Unexpected work item on timer queue");
                    break;
                }
            };

            if item.dequeue_count > self.config.max_dequeue_count {
                self.dead_letter(item).await?;
                continue;
            }

            if self.fire(item).await? {
                fired += 1;
            }
        }

        if fired > 0 {
            debug!(count = fired, "Fired due timers");
        }
        Ok(fired)
    }

    /// Sweep on a fixed interval until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.timer_sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("Timer sweep failed: {}", e);
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("Timer loop: shutdown requested");
                    break;
                }
            }
        }

        debug!("Timer loop exited");
    }

    async fn fire(&self, item: TimerWorkItem) -> Result<bool, DispatcherError> {
        let request = item.request.clone();
        let batch = CommitBatch::new().with_message(OrchestratorMessage::for_execution(
            request.instance_id.clone(),
            request.execution_id.clone(),
            HistoryEvent::TimerFired {
                id: request.timer_id,
                fire_at: request.fire_at,
            },
        ));
        let work_item = WorkItem::Timer(item);

        let result = retry_transient(&self.config.store_retry, "commit timer", || {
            self.store.complete_and_commit(&work_item, batch.clone())
        })
        .await;

        match result {
            Ok(()) => {
                debug!(
                    instance_id = %request.instance_id,
                    timer_id = request.timer_id,
                    "Timer fired"
                );
                Ok(true)
            }
            Err(e) if e.is_lease_conflict() => {
                warn!(instance_id = %request.instance_id, "Timer lease lost: {}", e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn dead_letter(&self, item: TimerWorkItem) -> Result<(), DispatcherError> {
        let reason = format!(
            "timer delivered {} times (max {})",
            item.dequeue_count, self.config.max_dequeue_count
        );
        info!(
            instance_id = %item.request.instance_id,
            timer_id = item.request.timer_id,
            "{}, dead-lettering",
            reason
        );

        let work_item = WorkItem::Timer(item);
        match self
            .store
            .dead_letter(&work_item, &reason, CommitBatch::new())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_lease_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
