//! Orchestration history and instance state
//!
//! This module contains the persisted data model:
//! - [`HistoryEvent`] enum for the append-only per-instance log
//! - [`RecordedEvent`] wrapper carrying sequence number and timestamp
//! - [`OrchestrationStatus`] and [`InstanceState`] for the instance table

mod event;
mod status;

pub use event::{error_types, FailureDetails, HistoryEvent, ParentLink, RecordedEvent};
pub use status::{InstanceState, OrchestrationInstance, OrchestrationStatus};
