//! Orchestrator trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use super::OrchestrationContext;
use crate::history::{error_types, FailureDetails};

/// Error type for orchestration failures
///
/// Returned from orchestrator code; recorded as `ExecutionFailed` and
/// reported by `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestrationError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Additional error details
    pub details: Option<Value>,
}

impl OrchestrationError {
    /// Create a new orchestration error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            details: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for OrchestrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for OrchestrationError {}

impl From<OrchestrationError> for FailureDetails {
    fn from(err: OrchestrationError) -> Self {
        FailureDetails {
            error_type: err
                .error_type
                .unwrap_or_else(|| error_types::ORCHESTRATION_FAILED.to_string()),
            message: err.message,
            details: err.details,
        }
    }
}

impl From<serde_json::Error> for OrchestrationError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string()).with_type(error_types::SERIALIZATION)
    }
}

impl From<TaskError> for OrchestrationError {
    fn from(err: TaskError) -> Self {
        Self {
            message: err.to_string(),
            error_type: Some(err.failure.error_type),
            details: err.failure.details,
        }
    }
}

impl From<AggregateError> for OrchestrationError {
    fn from(err: AggregateError) -> Self {
        let details = serde_json::to_value(&err.failures).ok();
        Self {
            message: err.to_string(),
            error_type: Some("AggregateTaskFailure".to_string()),
            details,
        }
    }
}

/// Failure of an awaited activity or sub-orchestration
///
/// This is how orchestrator code observes `TaskFailed` and
/// `SubOrchestrationFailed`: as an explicit error value on the awaited call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    /// Correlation id of the failed task
    pub task_id: u64,

    /// Activity or orchestration name
    pub name: String,

    pub failure: FailureDetails,
}

impl TaskError {
    /// Error type reported by the task
    pub fn error_type(&self) -> &str {
        &self.failure.error_type
    }

    /// Error message reported by the task
    pub fn message(&self) -> &str {
        &self.failure.message
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "task '{}' (id {}) failed: {}",
            self.name, self.task_id, self.failure.message
        )
    }
}

impl std::error::Error for TaskError {}

/// One or more tasks of a join failed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateError {
    /// Failures with the position of the task in the join
    pub failures: Vec<(usize, TaskError)>,
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} task(s) failed", self.failures.len())?;
        if let Some((_, first)) = self.failures.first() {
            write!(f, ", first: {}", first)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// An orchestrator is deterministic async code driven by replay
///
/// Orchestrators coordinate activities, timers, external events and
/// sub-orchestrations through the [`OrchestrationContext`]. They are re-run
/// from the start on every turn; anything already decided is answered from
/// history.
///
/// # Determinism
///
/// Orchestrator code must be a pure function of its input and the values
/// returned by the context. Do not read the system clock, generate random
/// numbers, or perform I/O; use `ctx.current_time()`, `ctx.new_guid()` and
/// activities instead.
///
/// # Example
///
/// ```ignore
/// use taskhub_durable::prelude::*;
///
/// struct Greeting;
///
/// #[async_trait]
/// impl Orchestrator for Greeting {
///     const NAME: &'static str = "greeting";
///     type Input = String;
///     type Output = String;
///
///     async fn run(
///         &self,
///         ctx: OrchestrationContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, OrchestrationError> {
///         let user = ctx.schedule_activity("get_user", json!(null)).await?;
///         let greeting = ctx.schedule_activity("send_greeting", user).await?;
///         Ok(serde_json::from_value(greeting)?)
///     }
/// }
/// ```
#[async_trait]
pub trait Orchestrator: Send + Sync + 'static {
    /// Unique name for this orchestration
    ///
    /// This is used to look up the orchestrator in the registry.
    const NAME: &'static str;

    /// Input type for the orchestration
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the orchestration
    type Output: Serialize + DeserializeOwned + Send;

    /// Run the orchestration logic
    async fn run(
        &self,
        ctx: OrchestrationContext,
        input: Self::Input,
    ) -> Result<Self::Output, OrchestrationError>;
}
