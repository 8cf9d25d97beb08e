//! Activity execution context

use tokio_util::sync::CancellationToken;

/// Context provided to activities during execution
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext, input: Input) -> Result<Output, ActivityError> {
///     tokio::select! {
///         result = do_work(input) => Ok(result?),
///         _ = ctx.cancelled() => Err(ActivityError::new("worker shutting down")),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Orchestration instance that scheduled this activity
    pub instance_id: String,

    /// Execution of the instance that scheduled this activity
    pub execution_id: String,

    /// Correlation id of the `TaskScheduled` event
    pub task_id: u64,

    /// Registered activity name
    pub name: String,

    /// Delivery attempt (1-based); above 1 after a lease expired or was abandoned
    pub attempt: u32,

    /// Worker executing the activity
    pub worker_id: String,

    cancellation: CancellationToken,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(
        instance_id: impl Into<String>,
        execution_id: impl Into<String>,
        task_id: u64,
        name: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: execution_id.into(),
            task_id,
            name: name.into(),
            attempt: 1,
            worker_id: String::new(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Set the delivery attempt
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    /// Set the executing worker
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Tie cancellation to an external token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when cancellation is requested
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Check if this activity has been delivered before
    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}
