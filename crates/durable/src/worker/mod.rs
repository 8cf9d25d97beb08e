//! Worker: dispatchers and timer service
//!
//! This module provides:
//! - [`TaskHubWorker`] - Hosts all loops for one worker process
//! - [`OrchestrationDispatcher`] - Runs replay turns and commits them
//! - [`ActivityDispatcher`] - Executes activities with backpressure
//! - [`TimerService`] - Fires due durable timers
//! - [`PollerConfig`] - Queue polling with exponential backoff
//! - [`BackpressureConfig`] - Load-aware leasing
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        TaskHubWorker                          │
//! │  ┌──────────────────────┐  ┌──────────────────────────────┐  │
//! │  │ OrchestrationDispatch│  │     ActivityDispatcher       │  │
//! │  │  WorkPoller          │  │  WorkPoller                  │  │
//! │  │  Semaphore           │  │  BackpressureState           │  │
//! │  │  ReplayEngine        │  │  Semaphore + lease renewal   │  │
//! │  └──────────┬───────────┘  └──────────────┬───────────────┘  │
//! │             │        ┌──────────────┐     │                  │
//! │             │        │ TimerService │     │                  │
//! │             │        │ (sweep loop) │     │                  │
//! │             │        └──────┬───────┘     │                  │
//! └─────────────┼───────────────┼─────────────┼──────────────────┘
//!               ▼               ▼             ▼
//!        ┌────────────────────────────────────────────┐
//!        │                TaskHubStore                │
//!        │  lease_next / complete_and_commit / abandon│
//!        └────────────────────────────────────────────┘
//! ```

mod activity;
mod backpressure;
mod host;
mod orchestration;
mod poller;
mod timer;

pub use activity::ActivityDispatcher;
pub use backpressure::{BackpressureConfig, BackpressureError, BackpressureState, LoadGuard};
pub use host::{TaskHubWorker, WorkerStatus};
pub use orchestration::{DispatcherError, OrchestrationDispatcher};
pub use poller::{PollerConfig, PollerError, WorkPoller};
pub use timer::TimerService;
