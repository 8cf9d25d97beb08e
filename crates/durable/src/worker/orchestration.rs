//! Orchestration dispatcher
//!
//! Leases orchestrator work items, runs one replay turn per item and commits
//! the turn's history, instance update and downstream work in a single
//! `complete_and_commit`.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{PollerError, WorkPoller};
use crate::clock::{Clock, SystemClock};
use crate::config::TaskHubConfig;
use crate::engine::{
    OrchestrationRegistry, RegistryError, ReplayEngine, ReplayError, TurnOutcome, TurnRequest,
    TurnResult,
};
use crate::history::{
    error_types, FailureDetails, HistoryEvent, InstanceState, OrchestrationStatus, ParentLink,
};
use crate::orchestration::OrchestratorAction;
use crate::persistence::{
    ActivityRequest, CommitBatch, InstanceUpdate, OrchestratorMessage, OrchestratorWorkItem,
    QueueKind, StoreError, TaskHubStore, TimerRequest, WorkItem,
};
use crate::reliability::retry_transient;

/// Dispatcher errors
#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("worker is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Runs orchestrator work items through the replay engine
pub struct OrchestrationDispatcher {
    store: Arc<dyn TaskHubStore>,
    registry: OrchestrationRegistry,
    engine: ReplayEngine,
    config: TaskHubConfig,
    clock: Arc<dyn Clock>,
    tracker: TaskTracker,
}

impl OrchestrationDispatcher {
    pub fn new(
        store: Arc<dyn TaskHubStore>,
        registry: OrchestrationRegistry,
        config: TaskHubConfig,
    ) -> Self {
        Self {
            store,
            registry,
            engine: ReplayEngine::new(),
            config,
            clock: Arc::new(SystemClock),
            tracker: TaskTracker::new(),
        }
    }

    /// Use `clock` for turn timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Lease and process one orchestrator work item
    ///
    /// Returns `false` if the queue had nothing to lease.
    pub async fn process_next(&self) -> Result<bool, DispatcherError> {
        let leased = self
            .store
            .lease_next(
                QueueKind::Orchestrator,
                &self.config.worker_id,
                self.config.lease_duration,
            )
            .await?;

        match leased {
            Some(WorkItem::Orchestrator(item)) => {
                self.process(item).await?;
                Ok(true)
            }
            Some(other) => {
                warn!(kind = %other.kind(), "Unexpected work item on orchestrator queue");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Process one leased orchestrator work item
    #[instrument(skip(self, item), fields(instance_id = %item.instance_id, messages = item.messages.len()))]
    pub async fn process(&self, item: OrchestratorWorkItem) -> Result<(), DispatcherError> {
        if item.dequeue_count > self.config.max_dequeue_count {
            return self.dead_letter(item).await;
        }

        let Some(state) = item.state.clone() else {
            warn!("Messages for unknown instance, discarding");
            return self.commit(item, CommitBatch::new()).await;
        };

        if state.status.is_terminal() {
            debug!(status = %state.status, "Instance is terminal, discarding messages");
            return self.commit(item, CommitBatch::new()).await;
        }

        let orchestrator = match self.registry.get(&state.name) {
            Ok(orchestrator) => orchestrator,
            Err(e) => {
                warn!(
                    name = %state.name,
                    delay_ms = self.config.unknown_orchestration_delay.as_millis() as u64,
                    "{}, abandoning work item",
                    e
                );
                return self.abandon(item).await;
            }
        };

        let messages: Vec<HistoryEvent> = item
            .messages
            .iter()
            .filter(|message| {
                message
                    .execution_id
                    .as_deref()
                    .map_or(true, |execution_id| execution_id == state.execution_id)
            })
            .map(|message| message.event.clone())
            .collect();

        let request = TurnRequest {
            instance_id: state.instance_id.clone(),
            execution_id: state.execution_id.clone(),
            history: item.history.iter().map(|e| e.event.clone()).collect(),
            messages,
            now: self.clock.now(),
        };

        let turn = match self.engine.run_turn(orchestrator.as_ref(), request) {
            Ok(turn) => turn,
            Err(ReplayError::MissingExecutionStarted(execution_id)) => {
                warn!(%execution_id, "Execution has not started yet, abandoning work item");
                return self.abandon(item).await;
            }
            Err(e) => {
                error!("Replay failed: {}", e);
                return self.abandon(item).await;
            }
        };

        if turn.is_empty() {
            debug!("No relevant messages, discarding");
            return self.commit(item, CommitBatch::new()).await;
        }

        let outcome = turn.outcome.clone();
        let batch = build_commit(&state, turn);
        self.commit(item, batch).await?;

        match outcome {
            TurnOutcome::Suspended => debug!("Turn committed, orchestration suspended"),
            TurnOutcome::Completed(_) => info!("Orchestration completed"),
            TurnOutcome::Failed(failure) => warn!(
                error_type = %failure.error_type,
                "Orchestration failed: {}",
                failure.message
            ),
            TurnOutcome::ContinuedAsNew(_) => info!("Orchestration continued as new"),
            TurnOutcome::Terminated(reason) => info!(%reason, "Orchestration terminated"),
        }
        Ok(())
    }

    /// Lease and process orchestrator work until shutdown
    pub async fn run(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.config.orchestration_concurrency));
        let mut poller = WorkPoller::new(
            Arc::clone(&self.store),
            self.config.worker_id.clone(),
            QueueKind::Orchestrator,
            self.config.lease_duration,
            self.config.poller.clone(),
            shutdown_rx,
        );

        loop {
            if poller.is_shutdown() {
                break;
            }

            let available = permits.available_permits();
            if available > 0 {
                match poller.poll(available).await {
                    Ok(items) => {
                        for item in items {
                            let WorkItem::Orchestrator(item) = item else {
                                continue;
                            };
                            let Ok(permit) = Arc::clone(&permits).try_acquire_owned() else {
                                break;
                            };
                            let dispatcher = Arc::clone(&self);
                            self.tracker.spawn(async move {
                                if let Err(e) = dispatcher.process(item).await {
                                    error!("Failed to process orchestrator work item: {}", e);
                                }
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

        debug!("Orchestration dispatcher loop exited");
    }

    /// Wait for in-flight turns to finish
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn commit(
        &self,
        item: OrchestratorWorkItem,
        batch: CommitBatch,
    ) -> Result<(), DispatcherError> {
        let work_item = WorkItem::Orchestrator(item);
        let result = retry_transient(&self.config.store_retry, "commit orchestration", || {
            self.store.complete_and_commit(&work_item, batch.clone())
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_lease_conflict() => {
                warn!("Commit rejected, discarding turn: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn abandon(&self, item: OrchestratorWorkItem) -> Result<(), DispatcherError> {
        let work_item = WorkItem::Orchestrator(item);
        match self
            .store
            .abandon_work_item(&work_item, Some(self.config.unknown_orchestration_delay))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_lease_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn dead_letter(&self, item: OrchestratorWorkItem) -> Result<(), DispatcherError> {
        let reason = format!(
            "orchestrator work item delivered {} times (max {})",
            item.dequeue_count, self.config.max_dequeue_count
        );
        error!(dequeue_count = item.dequeue_count, "{}, dead-lettering", reason);

        let batch = match &item.state {
            Some(state) if !state.status.is_terminal() => {
                let failure = FailureDetails::new(error_types::POISON_MESSAGE, reason.clone());
                let mut batch = CommitBatch::new()
                    .with_history(vec![HistoryEvent::ExecutionFailed {
                        error: failure.clone(),
                    }])
                    .with_instance_update(
                        InstanceUpdate::status(OrchestrationStatus::Failed)
                            .with_failure(failure.clone()),
                    );
                if let Some(parent) = &state.parent {
                    batch = batch.with_message(parent_failed(parent, failure));
                }
                batch
            }
            _ => CommitBatch::new(),
        };

        let work_item = WorkItem::Orchestrator(item);
        match self.store.dead_letter(&work_item, &reason, batch).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_lease_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Turn -> commit translation
// =============================================================================

/// Translate a replay turn into the batch that persists it
pub(crate) fn build_commit(state: &InstanceState, turn: TurnResult) -> CommitBatch {
    let TurnResult {
        history_delta,
        actions,
        outcome,
        custom_status,
    } = turn;

    let mut batch = CommitBatch::new().with_history(history_delta);

    for action in actions {
        batch = match action {
            OrchestratorAction::ScheduleActivity { id, name, input } => {
                batch.with_activity(ActivityRequest {
                    instance_id: state.instance_id.clone(),
                    execution_id: state.execution_id.clone(),
                    task_id: id,
                    name,
                    input,
                })
            }
            OrchestratorAction::CreateTimer { id, fire_at } => batch.with_timer(TimerRequest {
                instance_id: state.instance_id.clone(),
                execution_id: state.execution_id.clone(),
                timer_id: id,
                fire_at,
            }),
            OrchestratorAction::StartSubOrchestration {
                id,
                name,
                instance_id,
                input,
            } => batch.with_message(OrchestratorMessage::for_execution(
                instance_id,
                Uuid::now_v7().to_string(),
                HistoryEvent::ExecutionStarted {
                    name,
                    input,
                    parent: Some(ParentLink {
                        instance_id: state.instance_id.clone(),
                        execution_id: state.execution_id.clone(),
                        task_id: id,
                    }),
                },
            )),
            OrchestratorAction::WaitForExternalEvent { .. }
            | OrchestratorAction::Complete { .. }
            | OrchestratorAction::Fail { .. }
            | OrchestratorAction::ContinueAsNew { .. } => batch,
        };
    }

    let update = match outcome {
        TurnOutcome::Suspended => InstanceUpdate::status(OrchestrationStatus::Running),
        TurnOutcome::Completed(result) => {
            if let Some(parent) = &state.parent {
                batch = batch.with_message(OrchestratorMessage::for_execution(
                    parent.instance_id.clone(),
                    parent.execution_id.clone(),
                    HistoryEvent::SubOrchestrationCompleted {
                        id: parent.task_id,
                        result: result.clone(),
                    },
                ));
            }
            InstanceUpdate::status(OrchestrationStatus::Completed).with_output(result)
        }
        TurnOutcome::Failed(failure) => {
            if let Some(parent) = &state.parent {
                batch = batch.with_message(parent_failed(parent, failure.clone()));
            }
            InstanceUpdate::status(OrchestrationStatus::Failed).with_failure(failure)
        }
        TurnOutcome::Terminated(reason) => {
            if let Some(parent) = &state.parent {
                let failure = FailureDetails::new(
                    error_types::TERMINATED,
                    format!("sub-orchestration terminated: {}", reason),
                );
                batch = batch.with_message(parent_failed(parent, failure));
            }
            InstanceUpdate::status(OrchestrationStatus::Terminated).with_output(Value::String(reason))
        }
        TurnOutcome::ContinuedAsNew(input) => {
            let execution_id = Uuid::now_v7().to_string();
            batch = batch.with_message(OrchestratorMessage::for_execution(
                state.instance_id.clone(),
                execution_id.clone(),
                HistoryEvent::ExecutionStarted {
                    name: state.name.clone(),
                    input: input.clone(),
                    parent: state.parent.clone(),
                },
            ));
            InstanceUpdate::status(OrchestrationStatus::ContinuedAsNew)
                .with_new_execution(execution_id, input)
        }
    };

    batch.with_instance_update(update.with_custom_status(custom_status))
}

fn parent_failed(parent: &ParentLink, failure: FailureDetails) -> OrchestratorMessage {
    OrchestratorMessage::for_execution(
        parent.instance_id.clone(),
        parent.execution_id.clone(),
        HistoryEvent::SubOrchestrationFailed {
            id: parent.task_id,
            error: failure,
        },
    )
}
