//! Orchestration replay engine
//!
//! The engine module provides the `ReplayEngine`, which re-runs orchestrator
//! code against history one turn at a time, and the registry it looks
//! orchestrators up in.

mod registry;
mod replay;

pub use registry::{AnyOrchestrator, OrchestrationFuture, OrchestrationRegistry, RegistryError};
pub(crate) use replay::panic_message;
pub use replay::{ReplayEngine, ReplayError, TurnOutcome, TurnRequest, TurnResult};
