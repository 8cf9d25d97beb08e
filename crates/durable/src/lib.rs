//! # Durable Task Hub
//!
//! A replay-based durable orchestration framework with a PostgreSQL-backed
//! task hub.
//!
//! ## Features
//!
//! - **Replay-based orchestrations**: orchestrator code is re-run against its
//!   event history to decide what to do next, so progress survives crashes
//! - **Durable primitives**: activities, timers, external events,
//!   sub-orchestrations and continue-as-new
//! - **Fan-out/fan-in**: `when_all`, `try_when_all` and `when_any` joins
//! - **Leased work queues**: at most one worker per instance, with lease
//!   expiry, dequeue counts and a dead-letter table for poison work
//! - **Atomic commits**: one turn's history, status and new work land
//!   together or not at all
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TaskHubClient                           │
//! │  (start instances, raise events, terminate, status, purge)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       TaskHubStore                           │
//! │  (PostgreSQL: taskhub_instances, history, queues, timers)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TaskHubWorker                           │
//! │  OrchestrationDispatcher ──▶ ReplayEngine                   │
//! │  ActivityDispatcher      ──▶ ActivityRegistry               │
//! │  TimerService            ──▶ TimerFired messages            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use taskhub_durable::prelude::*;
//!
//! async fn fan_out(ctx: OrchestrationContext, input: Value) -> Result<Value, OrchestrationError> {
//!     let numbers: Vec<i64> = serde_json::from_value(input)?;
//!     let squares = numbers
//!         .iter()
//!         .map(|n| ctx.schedule_activity("square", json!(n)))
//!         .collect::<Vec<_>>();
//!     let squares = ctx.try_when_all(squares).await?;
//!     Ok(ctx.schedule_activity("sum", json!(squares)).await?)
//! }
//!
//! let mut worker = TaskHubWorker::new(store, TaskHubConfig::from_env());
//! worker
//!     .register_orchestration_fn("fan_out", fan_out)
//!     .register_activity_fn("square", square)
//!     .register_activity_fn("sum", sum);
//! worker.start()?;
//!
//! let id = worker.client().start_new_instance("fan_out", None, json!([1, 2, 3])).await?;
//! ```

pub mod activity;
pub mod client;
pub mod clock;
pub mod config;
pub mod engine;
pub mod history;
pub mod orchestration;
pub mod persistence;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError};
    pub use crate::client::{ClientError, TaskHubClient};
    pub use crate::config::TaskHubConfig;
    pub use crate::history::{FailureDetails, HistoryEvent, InstanceState, OrchestrationStatus};
    pub use crate::orchestration::{
        AggregateError, OrchestrationContext, OrchestrationError, Orchestrator, TaskError,
    };
    pub use crate::persistence::{
        InMemoryTaskHubStore, PostgresTaskHubStore, StoreError, TaskHubStore,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{TaskHubWorker, WorkerStatus};
    pub use serde_json::{json, Value};
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError};
pub use client::{ClientError, TaskHubClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::TaskHubConfig;
pub use engine::{ReplayEngine, ReplayError, TurnOutcome};
pub use history::{
    FailureDetails, HistoryEvent, InstanceState, OrchestrationStatus, RecordedEvent,
};
pub use orchestration::{
    AggregateError, OrchestrationContext, OrchestrationError, Orchestrator, TaskError,
};
pub use persistence::{InMemoryTaskHubStore, PostgresTaskHubStore, StoreError, TaskHubStore};
pub use reliability::RetryPolicy;
pub use worker::{DispatcherError, TaskHubWorker, WorkerStatus};
