//! Work items, leases and commit batches

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::history::{
    error_types, FailureDetails, HistoryEvent, InstanceState, OrchestrationStatus, ParentLink,
    RecordedEvent,
};

/// Queue a work item is leased from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Orchestrator,
    Activity,
    Timer,
}

impl QueueKind {
    /// Database representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Activity => "activity",
            Self::Timer => "timer",
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orchestrator" => Ok(Self::Orchestrator),
            "activity" => Ok(Self::Activity),
            "timer" => Ok(Self::Timer),
            other => Err(format!("unknown queue kind: {}", other)),
        }
    }
}

/// Time-bounded exclusive claim on a work item
///
/// Only the store decides whether a lease is still valid; the holder must
/// present the token on commit, abandon and renew.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: Uuid,

    /// Worker that holds the lease
    pub owner: String,

    pub expires_at: DateTime<Utc>,
}

/// Message for an orchestration instance
///
/// `execution_id` is `None` for messages addressed to whatever execution is
/// current (raised events, terminate); completions always name the execution
/// that scheduled them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorMessage {
    pub instance_id: String,
    pub execution_id: Option<String>,
    pub event: HistoryEvent,
}

impl OrchestratorMessage {
    /// Message for the current execution of an instance
    pub fn new(instance_id: impl Into<String>, event: HistoryEvent) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: None,
            event,
        }
    }

    /// Message for a specific execution
    pub fn for_execution(
        instance_id: impl Into<String>,
        execution_id: impl Into<String>,
        event: HistoryEvent,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id: Some(execution_id.into()),
            event,
        }
    }

    /// Failure for the parent when this message would start a
    /// sub-orchestration on an instance that already exists
    ///
    /// `existing_execution_id` is the current execution of the target
    /// instance. A continue-as-new start carries that same execution id and
    /// is let through.
    pub fn rejected_sub_orchestration(
        &self,
        existing_execution_id: &str,
    ) -> Option<OrchestratorMessage> {
        let HistoryEvent::ExecutionStarted {
            parent: Some(parent),
            ..
        } = &self.event
        else {
            return None;
        };
        if self.execution_id.as_deref() == Some(existing_execution_id) {
            return None;
        }

        Some(OrchestratorMessage::for_execution(
            parent.instance_id.clone(),
            parent.execution_id.clone(),
            HistoryEvent::SubOrchestrationFailed {
                id: parent.task_id,
                error: FailureDetails::new(
                    error_types::INSTANCE_ALREADY_EXISTS,
                    format!("instance {} already exists", self.instance_id),
                ),
            },
        ))
    }
}

/// Activity invocation to enqueue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRequest {
    pub instance_id: String,
    pub execution_id: String,

    /// Correlation id of the `TaskScheduled` event
    pub task_id: u64,

    pub name: String,
    pub input: Value,
}

/// Durable timer to schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerRequest {
    pub instance_id: String,
    pub execution_id: String,

    /// Correlation id of the `TimerCreated` event
    pub timer_id: u64,

    pub fire_at: DateTime<Utc>,
}

/// Leased batch of messages for one instance
#[derive(Debug, Clone)]
pub struct OrchestratorWorkItem {
    pub instance_id: String,

    /// Instance row as of the lease; `None` if the instance does not exist
    pub state: Option<InstanceState>,

    /// History of the current execution as of the lease
    pub history: Vec<RecordedEvent>,

    /// Messages consumed by committing this item
    pub messages: Vec<OrchestratorMessage>,

    pub lease: Lease,

    /// Highest dequeue count among the messages
    pub dequeue_count: u32,
}

/// Leased activity invocation
#[derive(Debug, Clone)]
pub struct ActivityWorkItem {
    pub id: Uuid,
    pub request: ActivityRequest,
    pub lease: Lease,
    pub dequeue_count: u32,
}

/// Leased due timer
#[derive(Debug, Clone)]
pub struct TimerWorkItem {
    pub id: Uuid,
    pub request: TimerRequest,
    pub lease: Lease,
    pub dequeue_count: u32,
}

/// A leased unit of work
#[derive(Debug, Clone)]
pub enum WorkItem {
    Orchestrator(OrchestratorWorkItem),
    Activity(ActivityWorkItem),
    Timer(TimerWorkItem),
}

impl WorkItem {
    pub fn kind(&self) -> QueueKind {
        match self {
            Self::Orchestrator(_) => QueueKind::Orchestrator,
            Self::Activity(_) => QueueKind::Activity,
            Self::Timer(_) => QueueKind::Timer,
        }
    }

    pub fn lease(&self) -> &Lease {
        match self {
            Self::Orchestrator(item) => &item.lease,
            Self::Activity(item) => &item.lease,
            Self::Timer(item) => &item.lease,
        }
    }

    pub fn dequeue_count(&self) -> u32 {
        match self {
            Self::Orchestrator(item) => item.dequeue_count,
            Self::Activity(item) => item.dequeue_count,
            Self::Timer(item) => item.dequeue_count,
        }
    }

    /// Instance the item belongs to
    pub fn instance_id(&self) -> &str {
        match self {
            Self::Orchestrator(item) => &item.instance_id,
            Self::Activity(item) => &item.request.instance_id,
            Self::Timer(item) => &item.request.instance_id,
        }
    }
}

/// New instance to create
#[derive(Debug, Clone, PartialEq)]
pub struct NewInstance {
    pub instance_id: String,
    pub execution_id: String,

    /// Registered orchestration name
    pub name: String,

    pub input: Value,
    pub parent: Option<ParentLink>,
}

impl NewInstance {
    /// The `ExecutionStarted` message that starts this instance
    pub fn start_message(&self) -> OrchestratorMessage {
        OrchestratorMessage::for_execution(
            self.instance_id.clone(),
            self.execution_id.clone(),
            HistoryEvent::ExecutionStarted {
                name: self.name.clone(),
                input: self.input.clone(),
                parent: self.parent.clone(),
            },
        )
    }
}

/// Change to the instance row, applied after history is appended
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceUpdate {
    pub status: OrchestrationStatus,

    /// Switch to a new execution; its history starts empty
    pub execution_id: Option<String>,

    /// Replace the input (new execution)
    pub input: Option<Value>,

    pub output: Option<Value>,
    pub failure: Option<FailureDetails>,

    /// Replace the custom status when set
    pub custom_status: Option<Value>,
}

impl InstanceUpdate {
    /// Update that only sets the status
    pub fn status(status: OrchestrationStatus) -> Self {
        Self {
            status,
            execution_id: None,
            input: None,
            output: None,
            failure: None,
            custom_status: None,
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_failure(mut self, failure: FailureDetails) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn with_custom_status(mut self, custom_status: Option<Value>) -> Self {
        self.custom_status = custom_status;
        self
    }

    /// Start a new execution with fresh input
    pub fn with_new_execution(mut self, execution_id: impl Into<String>, input: Value) -> Self {
        self.execution_id = Some(execution_id.into());
        self.input = Some(input);
        self
    }
}

/// Everything one `complete_and_commit` persists atomically
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitBatch {
    /// Events appended to the current execution's history
    pub history: Vec<HistoryEvent>,

    pub instance_update: Option<InstanceUpdate>,

    /// Messages for this or other instances
    pub orchestrator_messages: Vec<OrchestratorMessage>,

    pub activities: Vec<ActivityRequest>,

    pub timers: Vec<TimerRequest>,
}

impl CommitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(mut self, events: Vec<HistoryEvent>) -> Self {
        self.history = events;
        self
    }

    pub fn with_instance_update(mut self, update: InstanceUpdate) -> Self {
        self.instance_update = Some(update);
        self
    }

    pub fn with_message(mut self, message: OrchestratorMessage) -> Self {
        self.orchestrator_messages.push(message);
        self
    }

    pub fn with_activity(mut self, request: ActivityRequest) -> Self {
        self.activities.push(request);
        self
    }

    pub fn with_timer(mut self, request: TimerRequest) -> Self {
        self.timers.push(request);
        self
    }

    /// Check if committing only removes the consumed item
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
            && self.instance_update.is_none()
            && self.orchestrator_messages.is_empty()
            && self.activities.is_empty()
            && self.timers.is_empty()
    }
}

/// Filter for listing dead letters
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub instance_id: Option<String>,
    pub queue: Option<QueueKind>,
}

impl DeadLetterFilter {
    pub fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.instance_id
            .as_deref()
            .map_or(true, |id| id == entry.instance_id)
            && self.queue.map_or(true, |queue| queue == entry.queue)
    }
}

/// Pagination parameters
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Poison work item moved aside
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub queue: QueueKind,
    pub instance_id: String,

    /// The original message, activity request or timer
    pub payload: Value,

    pub reason: String,
    pub dequeue_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Pending work per queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub orchestrator_messages: u64,
    pub activities: u64,

    /// Timers not yet fired, due or not
    pub timers: u64,

    pub dead_letters: u64,
}
