//! Persistence layer for the task hub
//!
//! This module provides:
//! - [`TaskHubStore`] trait: instances, history, leased queues and timers
//! - [`InMemoryTaskHubStore`] for testing
//! - [`PostgresTaskHubStore`] for production

mod memory;
mod postgres;
mod store;
mod work_item;

pub use memory::InMemoryTaskHubStore;
pub use postgres::PostgresTaskHubStore;
pub use store::{StoreError, TaskHubStore};
pub use work_item::{
    ActivityRequest, ActivityWorkItem, CommitBatch, DeadLetterEntry, DeadLetterFilter,
    InstanceUpdate, Lease, NewInstance, OrchestratorMessage, OrchestratorWorkItem, Pagination,
    QueueDepths, QueueKind, TimerRequest, TimerWorkItem, WorkItem,
};
