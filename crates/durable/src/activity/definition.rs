//! Activity trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;
use crate::history::{error_types, FailureDetails};

/// Error type reported by failed activities when no type is given
pub const ACTIVITY_FAILED: &str = "ActivityFailed";

/// Error type for activity failures
///
/// Recorded as `TaskFailed` and surfaced to the orchestrator as a
/// `TaskError`. The runtime never retries a failed activity on its own;
/// orchestrator code decides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    /// Create a new activity error
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
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for ActivityError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string()).with_type(error_types::SERIALIZATION)
    }
}

impl From<ActivityError> for FailureDetails {
    fn from(err: ActivityError) -> Self {
        FailureDetails {
            error_type: err.error_type.unwrap_or_else(|| ACTIVITY_FAILED.to_string()),
            message: err.message,
            details: err.details,
        }
    }
}

/// An activity is a unit of work with side effects
///
/// Activities are the building blocks orchestrations schedule. They:
/// - Are executed by activity workers outside the orchestration
/// - Run at least once; a crash after running but before the result is
///   committed runs them again, so they should be idempotent
/// - Report failure as a value that the orchestrator observes
///
/// # Example
///
/// ```ignore
/// use taskhub_durable::prelude::*;
///
/// struct SendGreeting;
///
/// #[async_trait]
/// impl Activity for SendGreeting {
///     const NAME: &'static str = "send_greeting";
///     type Input = String;
///     type Output = String;
///
///     async fn execute(
///         &self,
///         _ctx: &ActivityContext,
///         user: Self::Input,
///     ) -> Result<Self::Output, ActivityError> {
///         Ok(format!("Greeting send to {}", user))
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Unique name for this activity
    ///
    /// This is used to look up the activity in the registry.
    const NAME: &'static str;

    /// Input type for the activity
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the activity
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute the activity
    ///
    /// The context provides the owning instance, the attempt number and a
    /// cancellation token that fires on worker shutdown.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}
