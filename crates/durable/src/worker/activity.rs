//! Activity dispatcher
//!
//! Executes leased activity work items with bounded concurrency and reports
//! each result to the scheduling orchestration as a `TaskCompleted` or
//! `TaskFailed` message.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::backpressure::BackpressureState;
use super::orchestration::DispatcherError;
use super::poller::WorkPoller;
use crate::activity::{ActivityContext, ActivityRegistry};
use crate::config::TaskHubConfig;
use crate::engine::panic_message;
use crate::history::{error_types, FailureDetails, HistoryEvent};
use crate::persistence::{
    ActivityWorkItem, CommitBatch, OrchestratorMessage, QueueKind, TaskHubStore, WorkItem,
};
use crate::reliability::retry_transient;

/// Executes activities leased from the activity queue
pub struct ActivityDispatcher {
    store: Arc<dyn TaskHubStore>,
    registry: ActivityRegistry,
    config: TaskHubConfig,
    backpressure: Arc<BackpressureState>,
    permits: Arc<Semaphore>,
    cancellation: CancellationToken,
    tracker: TaskTracker,
}

impl ActivityDispatcher {
    pub fn new(
        store: Arc<dyn TaskHubStore>,
        registry: ActivityRegistry,
        config: TaskHubConfig,
    ) -> Self {
        let backpressure = Arc::new(BackpressureState::new(
            config.backpressure.clone(),
            config.activity_concurrency,
        ));
        Self {
            store,
            registry,
            permits: Arc::new(Semaphore::new(config.activity_concurrency)),
            backpressure,
            config,
            cancellation: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Activities currently executing
    pub fn in_flight(&self) -> usize {
        self.backpressure.in_flight()
    }

    /// Check if the dispatcher is leasing new work
    pub fn is_accepting(&self) -> bool {
        self.backpressure.is_accepting()
    }

    /// Lease and execute one activity inline
    ///
    /// Returns `false` if the queue had nothing to lease.
    pub async fn process_next(&self) -> Result<bool, DispatcherError> {
        let leased = self
            .store
            .lease_next(
                QueueKind::Activity,
                &self.config.worker_id,
                self.config.lease_duration,
            )
            .await?;

        match leased {
            Some(WorkItem::Activity(item)) => {
                self.process(item).await?;
                Ok(true)
            }
            Some(other) => {
                warn!(kind = %other.kind(), "Unexpected work item on activity queue");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Execute one leased activity and commit its result
    #[instrument(
        skip(self, item),
        fields(
            instance_id = %item.request.instance_id,
            task_id = item.request.task_id,
            activity = %item.request.name,
        )
    )]
    pub async fn process(&self, item: ActivityWorkItem) -> Result<(), DispatcherError> {
        if item.dequeue_count > self.config.max_dequeue_count {
            return self.dead_letter(item).await;
        }

        let Some(activity) = self.registry.get(&item.request.name) else {
            warn!("Activity is not registered, failing task");
            let failure = FailureDetails::new(
                error_types::ACTIVITY_NOT_REGISTERED,
                format!("no activity registered with name: {}", item.request.name),
            );
            let event = HistoryEvent::TaskFailed {
                id: item.request.task_id,
                error: failure,
            };
            return self.commit(item, event).await;
        };

        let ctx = ActivityContext::new(
            item.request.instance_id.clone(),
            item.request.execution_id.clone(),
            item.request.task_id,
            item.request.name.clone(),
        )
        .with_attempt(item.dequeue_count)
        .with_worker_id(self.config.worker_id.clone())
        .with_cancellation(self.cancellation.child_token());

        debug!(attempt = item.dequeue_count, "Executing activity");
        let execution =
            AssertUnwindSafe(activity.execute(ctx, item.request.input.clone())).catch_unwind();
        tokio::pin!(execution);

        let mut work_item = WorkItem::Activity(item);
        let mut renew = tokio::time::interval(renew_interval(self.config.lease_duration));
        renew.tick().await;

        let result = loop {
            tokio::select! {
                result = &mut execution => break result,
                _ = renew.tick() => {
                    match self.store.renew_lease(&work_item, self.config.lease_duration).await {
                        Ok(lease) => {
                            if let WorkItem::Activity(item) = &mut work_item {
                                item.lease = lease;
                            }
                        }
                        Err(e) if e.is_lease_conflict() => {
                            warn!("Lease lost while executing, dropping activity");
                            return Ok(());
                        }
                        Err(e) => warn!("Failed to renew activity lease: {}", e),
                    }
                }
            }
        };

        let WorkItem::Activity(item) = work_item else {
            return Ok(());
        };

        if self.cancellation.is_cancelled() {
            info!("Worker shutting down, releasing activity for redelivery");
            let work_item = WorkItem::Activity(item);
            return match self.store.abandon_work_item(&work_item, None).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_lease_conflict() => Ok(()),
                Err(e) => Err(e.into()),
            };
        }

        let task_id = item.request.task_id;
        let event = match result {
            Ok(Ok(output)) => {
                debug!("Activity completed");
                HistoryEvent::TaskCompleted {
                    id: task_id,
                    result: output,
                }
            }
            Ok(Err(e)) => {
                warn!("Activity failed: {}", e);
                HistoryEvent::TaskFailed {
                    id: task_id,
                    error: e.into(),
                }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref(), "activity panicked");
                error!("Activity panicked: {}", message);
                HistoryEvent::TaskFailed {
                    id: task_id,
                    error: FailureDetails::new(error_types::ACTIVITY_PANICKED, message),
                }
            }
        };

        self.commit(item, event).await
    }

    /// Lease and execute activities until shutdown
    pub async fn run(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) {
        let mut poller = WorkPoller::new(
            Arc::clone(&self.store),
            self.config.worker_id.clone(),
            QueueKind::Activity,
            self.config.lease_duration,
            self.config.poller.clone(),
            shutdown_rx,
        );

        loop {
            if poller.is_shutdown() {
                debug!("Activity poll loop: shutdown requested");
                break;
            }

            if !self.backpressure.should_accept() {
                debug!(
                    reason = ?self.backpressure.backpressure_reason(),
                    "Activity poll loop: under backpressure, waiting"
                );
                if poller.wait().await {
                    break;
                }
                continue;
            }

            let available = self
                .backpressure
                .available_slots()
                .min(self.permits.available_permits());
            if available > 0 {
                match poller.poll(available).await {
                    Ok(items) => {
                        for item in items {
                            let WorkItem::Activity(item) = item else {
                                continue;
                            };
                            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                                debug!("No permits available");
                                break;
                            };
                            let guard = self.backpressure.track();
                            let dispatcher = Arc::clone(&self);
                            self.tracker.spawn(async move {
                                if let Err(e) = dispatcher.process(item).await {
                                    error!("Failed to process activity work item: {}", e);
                                }
                                drop(guard);
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => error!("Poll error: {}", e),
                }
            }

            if poller.wait().await {
                break;
            }
        }

        debug!("Activity poll loop exited");
    }

    /// Wait for running activities, cancelling them after `timeout`
    ///
    /// Cancelled activities are abandoned and run again elsewhere.
    pub async fn drain(&self, timeout: Duration) -> Result<(), DispatcherError> {
        self.backpressure.pause("draining");
        self.tracker.close();

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok() {
            return Ok(());
        }

        warn!(
            remaining = self.backpressure.in_flight(),
            "Shutdown timeout reached, cancelling activities"
        );
        self.cancellation.cancel();
        self.tracker.wait().await;
        Err(DispatcherError::ShutdownTimeout)
    }

    async fn commit(&self, item: ActivityWorkItem, event: HistoryEvent) -> Result<(), DispatcherError> {
        let batch = CommitBatch::new().with_message(OrchestratorMessage::for_execution(
            item.request.instance_id.clone(),
            item.request.execution_id.clone(),
            event,
        ));
        let work_item = WorkItem::Activity(item);

        let result = retry_transient(&self.config.store_retry, "commit activity", || {
            self.store.complete_and_commit(&work_item, batch.clone())
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_lease_conflict() => {
                warn!("Activity result rejected, lease lost: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn dead_letter(&self, item: ActivityWorkItem) -> Result<(), DispatcherError> {
        let reason = format!(
            "activity delivered {} times (max {})",
            item.dequeue_count, self.config.max_dequeue_count
        );
        error!(dequeue_count = item.dequeue_count, "{}, dead-lettering", reason);

        let batch = CommitBatch::new().with_message(OrchestratorMessage::for_execution(
            item.request.instance_id.clone(),
            item.request.execution_id.clone(),
            HistoryEvent::TaskFailed {
                id: item.request.task_id,
                error: FailureDetails::new(error_types::POISON_MESSAGE, reason.clone()),
            },
        ));

        let work_item = WorkItem::Activity(item);
        match self.store.dead_letter(&work_item, &reason, batch).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_lease_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn renew_interval(lease_duration: Duration) -> Duration {
    (lease_duration / 2).max(Duration::from_millis(10))
}
