//! History events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known failure types produced by the runtime itself
pub mod error_types {
    /// Replay disagreed with recorded history
    pub const NON_DETERMINISTIC_REPLAY: &str = "NonDeterministicReplay";
    /// Orchestrator code panicked during replay
    pub const ORCHESTRATOR_PANICKED: &str = "OrchestratorPanicked";
    /// Activity code panicked
    pub const ACTIVITY_PANICKED: &str = "ActivityPanicked";
    /// No handler registered for the activity name
    pub const ACTIVITY_NOT_REGISTERED: &str = "ActivityNotRegistered";
    /// Work item exceeded the maximum dequeue count
    pub const POISON_MESSAGE: &str = "PoisonMessage";
    /// Orchestrator returned an error without a type
    pub const ORCHESTRATION_FAILED: &str = "OrchestrationFailed";
    /// A sub-orchestration was terminated
    pub const TERMINATED: &str = "Terminated";
    /// Input or output could not be (de)serialized
    pub const SERIALIZATION: &str = "SerializationError";
    /// A sub-orchestration was started under an instance id already in use
    pub const INSTANCE_ALREADY_EXISTS: &str = "InstanceAlreadyExists";
}

/// Failure payload recorded in history
///
/// This is the tagged error half of every `Ok(value) | Failed(error)` outcome:
/// activity failures, sub-orchestration failures and execution failures all
/// carry one of these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureDetails {
    /// Error type/code for programmatic handling
    pub error_type: String,

    /// Human readable message
    pub message: String,

    /// Additional details (for debugging)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl FailureDetails {
    /// Create failure details
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Attach details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Check the error type
    pub fn is(&self, error_type: &str) -> bool {
        self.error_type == error_type
    }
}

impl std::fmt::Display for FailureDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

/// Link from a sub-orchestration back to the task in its parent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParentLink {
    pub instance_id: String,
    pub execution_id: String,
    /// Correlation id of the `SubOrchestrationCreated` event in the parent
    pub task_id: u64,
}

/// Events stored in the taskhub_history table
///
/// These events form the append-only log for one execution of an
/// orchestration instance. Orchestrator state is never stored directly; it
/// is reconstructed by replaying these events in sequence order.
///
/// Scheduling events (`TaskScheduled`, `TimerCreated`,
/// `SubOrchestrationCreated`) record decisions made by orchestrator code.
/// Completion events (`TaskCompleted`, `TimerFired`, ...) arrive as messages
/// and are matched back to the decision by correlation `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    // =========================================================================
    // Execution Lifecycle Events
    // =========================================================================
    /// Execution was started with the given input
    ExecutionStarted {
        /// Registered orchestration name
        name: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ParentLink>,
    },

    /// Marks the start of one replay turn; source of deterministic time
    OrchestratorStarted { timestamp: DateTime<Utc> },

    /// Execution completed successfully
    ExecutionCompleted { result: Value },

    /// Execution failed
    ExecutionFailed { error: FailureDetails },

    /// Execution was terminated out-of-band
    ExecutionTerminated { reason: String },

    /// Execution restarted itself with fresh input
    ContinueAsNew { input: Value },

    // =========================================================================
    // Activity Events
    // =========================================================================
    /// Activity was scheduled by orchestrator code
    TaskScheduled { id: u64, name: String, input: Value },

    /// Activity completed successfully
    TaskCompleted { id: u64, result: Value },

    /// Activity failed
    TaskFailed { id: u64, error: FailureDetails },

    // =========================================================================
    // Timer Events
    // =========================================================================
    /// Durable timer was created
    TimerCreated { id: u64, fire_at: DateTime<Utc> },

    /// Durable timer fired
    TimerFired { id: u64, fire_at: DateTime<Utc> },

    // =========================================================================
    // Sub-Orchestration Events
    // =========================================================================
    /// Sub-orchestration was started
    SubOrchestrationCreated {
        id: u64,
        name: String,
        instance_id: String,
        input: Value,
    },

    /// Sub-orchestration completed successfully
    SubOrchestrationCompleted { id: u64, result: Value },

    /// Sub-orchestration failed or was terminated
    SubOrchestrationFailed { id: u64, error: FailureDetails },

    // =========================================================================
    // External Events
    // =========================================================================
    /// External event delivered to the instance
    EventRaised { name: String, input: Value },
}

impl HistoryEvent {
    /// Stable name of the variant, used as the `event_type` column
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution_started",
            Self::OrchestratorStarted { .. } => "orchestrator_started",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::ExecutionTerminated { .. } => "execution_terminated",
            Self::ContinueAsNew { .. } => "continue_as_new",
            Self::TaskScheduled { .. } => "task_scheduled",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TimerCreated { .. } => "timer_created",
            Self::TimerFired { .. } => "timer_fired",
            Self::SubOrchestrationCreated { .. } => "sub_orchestration_created",
            Self::SubOrchestrationCompleted { .. } => "sub_orchestration_completed",
            Self::SubOrchestrationFailed { .. } => "sub_orchestration_failed",
            Self::EventRaised { .. } => "event_raised",
        }
    }

    /// Correlation id for scheduling and completion events
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            Self::TaskScheduled { id, .. }
            | Self::TaskCompleted { id, .. }
            | Self::TaskFailed { id, .. }
            | Self::TimerCreated { id, .. }
            | Self::TimerFired { id, .. }
            | Self::SubOrchestrationCreated { id, .. }
            | Self::SubOrchestrationCompleted { id, .. }
            | Self::SubOrchestrationFailed { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Check if this event records a decision made by orchestrator code
    pub fn is_decision(&self) -> bool {
        matches!(
            self,
            Self::TaskScheduled { .. }
                | Self::TimerCreated { .. }
                | Self::SubOrchestrationCreated { .. }
        )
    }

    /// Check if this event resolves a previously recorded decision
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            Self::TaskCompleted { .. }
                | Self::TaskFailed { .. }
                | Self::TimerFired { .. }
                | Self::SubOrchestrationCompleted { .. }
                | Self::SubOrchestrationFailed { .. }
        )
    }

    /// Check if a completion event answers the given decision event
    pub fn completes(&self, decision: &HistoryEvent) -> bool {
        match (self, decision) {
            (
                Self::TaskCompleted { id, .. } | Self::TaskFailed { id, .. },
                Self::TaskScheduled { id: scheduled, .. },
            ) => id == scheduled,
            (Self::TimerFired { id, .. }, Self::TimerCreated { id: created, .. }) => id == created,
            (
                Self::SubOrchestrationCompleted { id, .. } | Self::SubOrchestrationFailed { id, .. },
                Self::SubOrchestrationCreated { id: created, .. },
            ) => id == created,
            _ => false,
        }
    }

    /// Check if this is a terminal execution event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionCompleted { .. }
                | Self::ExecutionFailed { .. }
                | Self::ExecutionTerminated { .. }
                | Self::ContinueAsNew { .. }
        )
    }
}

/// A history event as persisted, with its position in the log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedEvent {
    /// Position within the execution, starting at 0
    pub sequence: i64,

    /// When the event was appended
    pub timestamp: DateTime<Utc>,

    pub event: HistoryEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_history_event_serialization() {
        let event = HistoryEvent::ExecutionStarted {
            name: "greetings".to_string(),
            input: json!("5"),
            parent: None,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"execution_started\""));
        assert!(!json.contains("parent"));

        let parsed: HistoryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_task_failed_carries_failure_details() {
        let event = HistoryEvent::TaskFailed {
            id: 3,
            error: FailureDetails::new("Timeout", "upstream timed out")
                .with_details(json!({"host": "db-1"})),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_failed");
        assert_eq!(json["error"]["error_type"], "Timeout");

        let parsed: HistoryEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_correlation_ids() {
        let scheduled = HistoryEvent::TaskScheduled {
            id: 7,
            name: "square".to_string(),
            input: json!(2),
        };
        let completed = HistoryEvent::TaskCompleted {
            id: 7,
            result: json!(4),
        };
        let raised = HistoryEvent::EventRaised {
            name: "approval".to_string(),
            input: json!(true),
        };

        assert_eq!(scheduled.correlation_id(), Some(7));
        assert_eq!(completed.correlation_id(), Some(7));
        assert_eq!(raised.correlation_id(), None);
        assert!(scheduled.is_decision());
        assert!(completed.is_completion());
        assert!(completed.completes(&scheduled));
    }

    #[test]
    fn test_completion_kind_must_match_decision() {
        let timer = HistoryEvent::TimerCreated {
            id: 1,
            fire_at: Utc::now(),
        };
        let task_done = HistoryEvent::TaskCompleted {
            id: 1,
            result: json!(null),
        };

        assert!(!task_done.completes(&timer));
    }

    #[test]
    fn test_terminal_events() {
        assert!(HistoryEvent::ExecutionCompleted { result: json!(1) }.is_terminal());
        assert!(HistoryEvent::ContinueAsNew { input: json!(1) }.is_terminal());
        assert!(!HistoryEvent::OrchestratorStarted {
            timestamp: Utc::now()
        }
        .is_terminal());
    }
}
