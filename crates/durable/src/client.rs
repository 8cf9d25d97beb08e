//! Task hub client
//!
//! Starts instances, delivers external events, terminates and purges
//! instances, and reads their status and history. The client only writes
//! through the store; it never runs orchestrator code.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::history::{HistoryEvent, InstanceState, RecordedEvent};
use crate::orchestration::Orchestrator;
use crate::persistence::{
    DeadLetterEntry, DeadLetterFilter, NewInstance, OrchestratorMessage, Pagination, QueueDepths,
    StoreError, TaskHubStore,
};

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// The instance already reached a terminal status
    #[error("instance is not running: {0}")]
    InstanceNotRunning(String),

    #[error("timed out waiting for instance {0}")]
    Timeout(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Client for a task hub
///
/// # Example
///
/// ```ignore
/// let client = TaskHubClient::new(store);
/// let id = client
///     .start_new_instance("greeting", None, json!("5"))
///     .await?;
/// let state = client
///     .wait_for_completion(&id, Duration::from_secs(30))
///     .await?;
/// ```
#[derive(Clone)]
pub struct TaskHubClient {
    store: Arc<dyn TaskHubStore>,
    poll_interval: Duration,
}

impl TaskHubClient {
    pub fn new(store: Arc<dyn TaskHubStore>) -> Self {
        Self {
            store,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Set how often `wait_for_completion` reads the instance status
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Start a new orchestration instance
    ///
    /// Generates an instance id when none is given. Starting an id whose
    /// instance is still active fails with `InstanceAlreadyExists`; a
    /// terminal instance with the same id is replaced.
    #[instrument(skip(self, input))]
    pub async fn start_new_instance(
        &self,
        orchestration: &str,
        instance_id: Option<String>,
        input: Value,
    ) -> Result<String, ClientError> {
        let instance_id = instance_id.unwrap_or_else(|| Uuid::now_v7().to_string());

        self.store
            .create_instance(NewInstance {
                instance_id: instance_id.clone(),
                execution_id: Uuid::now_v7().to_string(),
                name: orchestration.to_string(),
                input,
                parent: None,
            })
            .await?;

        info!(%instance_id, orchestration, "Started orchestration instance");
        Ok(instance_id)
    }

    /// Start a typed orchestration under its registered name
    pub async fn start<O: Orchestrator>(
        &self,
        instance_id: Option<String>,
        input: &O::Input,
    ) -> Result<String, ClientError> {
        let input = serde_json::to_value(input)?;
        self.start_new_instance(O::NAME, instance_id, input).await
    }

    /// Deliver an external event to the current execution
    #[instrument(skip(self, input))]
    pub async fn raise_event(
        &self,
        instance_id: &str,
        name: &str,
        input: Value,
    ) -> Result<(), ClientError> {
        self.require_active(instance_id).await?;
        self.store
            .enqueue_orchestrator_message(OrchestratorMessage::new(
                instance_id,
                HistoryEvent::EventRaised {
                    name: name.to_string(),
                    input,
                },
            ))
            .await?;
        debug!("Raised event");
        Ok(())
    }

    /// Terminate an instance
    ///
    /// The instance stops at its next turn with status `Terminated` and the
    /// reason as output.
    #[instrument(skip(self))]
    pub async fn terminate(&self, instance_id: &str, reason: &str) -> Result<(), ClientError> {
        self.require_active(instance_id).await?;
        self.store
            .enqueue_orchestrator_message(OrchestratorMessage::new(
                instance_id,
                HistoryEvent::ExecutionTerminated {
                    reason: reason.to_string(),
                },
            ))
            .await?;
        info!("Termination requested");
        Ok(())
    }

    /// Read the instance row
    pub async fn get_status(&self, instance_id: &str) -> Result<Option<InstanceState>, ClientError> {
        Ok(self.store.get_instance(instance_id).await?)
    }

    /// Read the history of the current execution
    pub async fn get_history(&self, instance_id: &str) -> Result<Vec<RecordedEvent>, ClientError> {
        Ok(self.store.read_history(instance_id).await?)
    }

    /// Remove a terminal instance with its history
    ///
    /// Returns `false` if the instance does not exist.
    #[instrument(skip(self))]
    pub async fn purge_instance(&self, instance_id: &str) -> Result<bool, ClientError> {
        let purged = self.store.purge_instance(instance_id).await?;
        if purged {
            info!("Purged instance");
        }
        Ok(purged)
    }

    /// Poll until the instance reaches a terminal status
    pub async fn wait_for_completion(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<InstanceState, ClientError> {
        let poll = async {
            loop {
                match self.store.get_instance(instance_id).await? {
                    Some(state) if state.status.is_terminal() => return Ok(state),
                    Some(_) => {}
                    None => return Err(ClientError::InstanceNotFound(instance_id.to_string())),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| ClientError::Timeout(instance_id.to_string()))?
    }

    /// List dead-lettered work items
    pub async fn dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, ClientError> {
        Ok(self.store.list_dead_letters(filter, pagination).await?)
    }

    /// Pending work per queue
    pub async fn queue_depths(&self) -> Result<QueueDepths, ClientError> {
        Ok(self.store.queue_depths().await?)
    }

    async fn require_active(&self, instance_id: &str) -> Result<InstanceState, ClientError> {
        let state = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| ClientError::InstanceNotFound(instance_id.to_string()))?;
        if state.status.is_terminal() {
            return Err(ClientError::InstanceNotRunning(instance_id.to_string()));
        }
        Ok(state)
    }
}
