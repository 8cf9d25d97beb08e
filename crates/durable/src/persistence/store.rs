//! TaskHubStore trait definition

use std::time::Duration;

use async_trait::async_trait;

use super::work_item::*;
use crate::history::{InstanceState, OrchestrationStatus, RecordedEvent};

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Instance not found
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// Instance exists and is still active
    #[error("instance already exists: {0}")]
    InstanceAlreadyExists(String),

    /// Operation requires a terminal instance
    #[error("instance is not terminal: {0}")]
    InstanceNotTerminal(String),

    /// Lease token is unknown or expired
    #[error("lease lost")]
    LeaseLost,

    /// History advanced since the lease was issued
    #[error("concurrency conflict: expected history length {expected}, got {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    /// Status would move backwards
    #[error("invalid status transition from {from} to {to}")]
    InvalidStatusTransition {
        from: OrchestrationStatus,
        to: OrchestrationStatus,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Check if retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }

    /// Check if the caller no longer owns the work item
    pub fn is_lease_conflict(&self) -> bool {
        matches!(self, Self::LeaseLost | Self::ConcurrencyConflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Apply an instance update in place, rejecting status regressions
pub(crate) fn apply_instance_update(
    instance: &mut InstanceState,
    update: InstanceUpdate,
) -> Result<(), StoreError> {
    if !instance.status.can_transition_to(update.status) {
        return Err(StoreError::InvalidStatusTransition {
            from: instance.status,
            to: update.status,
        });
    }

    if let Some(execution_id) = update.execution_id {
        instance.execution_id = execution_id;
        instance.history_length = 0;
        instance.output = None;
        instance.failure = None;
    }
    if let Some(input) = update.input {
        instance.input = input;
    }
    instance.status = update.status;
    if let Some(output) = update.output {
        instance.output = Some(output);
    }
    if let Some(failure) = update.failure {
        instance.failure = Some(failure);
    }
    if let Some(custom_status) = update.custom_status {
        instance.custom_status = Some(custom_status);
    }
    Ok(())
}

/// Durable task hub: instances, history, queues and timers
///
/// This trait defines the storage protocol every backend implements.
/// Implementations must be thread-safe and support concurrent access from
/// many worker processes.
///
/// # Leasing
///
/// `lease_next` hands out at most one orchestrator lease per instance at a
/// time. Every lease carries a token and an expiry; an expired lease is
/// presumed abandoned and the item becomes leasable again. Commits, abandons
/// and renewals must present a valid token, otherwise they fail with
/// [`StoreError::LeaseLost`].
///
/// # Commit
///
/// `complete_and_commit` is the single atomic commit point: either every
/// part of the [`CommitBatch`] becomes visible together with the removal of
/// the consumed work, or nothing does.
#[async_trait]
pub trait TaskHubStore: Send + Sync + 'static {
    /// Create tables or other backing structures
    async fn initialize(&self) -> Result<(), StoreError>;

    // =========================================================================
    // Instance Operations
    // =========================================================================

    /// Create an instance and enqueue its `ExecutionStarted`
    ///
    /// Fails with `InstanceAlreadyExists` if a non-terminal instance with the
    /// same id exists. A terminal instance is replaced.
    async fn create_instance(&self, instance: NewInstance) -> Result<(), StoreError>;

    /// Get the instance row
    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceState>, StoreError>;

    /// Read the history of the current execution, in sequence order
    async fn read_history(&self, instance_id: &str) -> Result<Vec<RecordedEvent>, StoreError>;

    /// Remove a terminal instance with all its history and pending work
    ///
    /// Returns `false` if the instance does not exist.
    async fn purge_instance(&self, instance_id: &str) -> Result<bool, StoreError>;

    // =========================================================================
    // Queue Operations
    // =========================================================================

    /// Enqueue a message for an instance
    ///
    /// An `ExecutionStarted` message creates the instance row if it is
    /// missing.
    async fn enqueue_orchestrator_message(
        &self,
        message: OrchestratorMessage,
    ) -> Result<(), StoreError>;

    /// Enqueue an activity invocation
    async fn enqueue_activity_work(&self, request: ActivityRequest) -> Result<(), StoreError>;

    /// Schedule a timer; scheduling the same timer twice is a no-op
    async fn enqueue_timer(&self, request: TimerRequest) -> Result<(), StoreError>;

    /// Lease the next available item from a queue
    ///
    /// For timers only due items (`fire_at <= now`) are leased. Every lease
    /// increments the item's dequeue count.
    async fn lease_next(
        &self,
        queue: QueueKind,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<WorkItem>, StoreError>;

    /// Atomically persist the result of a leased work item
    ///
    /// - Orchestrator: fails with `ConcurrencyConflict` if the instance's
    ///   history grew since the lease; appends history, applies the instance
    ///   update, deletes the consumed messages, enqueues new work and
    ///   releases the instance lock.
    /// - Activity: deletes the activity and enqueues the batch's messages.
    /// - Timer: marks the timer fired and enqueues the batch's messages.
    async fn complete_and_commit(
        &self,
        item: &WorkItem,
        batch: CommitBatch,
    ) -> Result<(), StoreError>;

    /// Release a lease without committing
    ///
    /// The item becomes visible again after `delay`.
    async fn abandon_work_item(
        &self,
        item: &WorkItem,
        delay: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Extend a lease; returns the new lease
    async fn renew_lease(&self, item: &WorkItem, extend_by: Duration)
        -> Result<Lease, StoreError>;

    /// Move a poison item to the dead-letter table
    ///
    /// `batch` is committed in the same transaction, exactly as
    /// `complete_and_commit` would.
    async fn dead_letter(
        &self,
        item: &WorkItem,
        reason: &str,
        batch: CommitBatch,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Management Operations
    // =========================================================================

    /// List dead letters, newest first
    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Pending work per queue
    async fn queue_depths(&self) -> Result<QueueDepths, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(StoreError::Database("connection reset".to_string()).is_transient());
        assert!(!StoreError::LeaseLost.is_transient());
        assert!(!StoreError::InstanceNotFound("x".to_string()).is_transient());
    }

    #[test]
    fn test_lease_conflicts() {
        assert!(StoreError::LeaseLost.is_lease_conflict());
        assert!(StoreError::ConcurrencyConflict {
            expected: 3,
            actual: 5
        }
        .is_lease_conflict());
        assert!(!StoreError::Database("x".to_string()).is_lease_conflict());
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::InvalidStatusTransition {
            from: OrchestrationStatus::Completed,
            to: OrchestrationStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "invalid status transition from completed to running"
        );
    }
}
