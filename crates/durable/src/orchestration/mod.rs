//! Orchestrator-facing API
//!
//! This module contains everything orchestrator code touches:
//! - [`Orchestrator`] trait for typed orchestrations
//! - [`OrchestrationContext`] with the durable primitives
//! - [`DurableFuture`] and the join combinators
//! - [`OrchestratorAction`] produced by a replay turn

mod action;
mod context;
mod definition;
mod future;

pub use action::OrchestratorAction;
pub use context::{DurableFuture, OrchestrationContext};
pub use definition::{AggregateError, OrchestrationError, Orchestrator, TaskError};
pub use future::{TryWhenAll, TypedFuture, WhenAll, WhenAny};

pub(crate) use context::{Completion, ReplayState};
