//! Orchestrator actions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::history::FailureDetails;

/// Actions produced by one replay turn
///
/// Scheduling actions are persisted as history events (`TaskScheduled`,
/// `TimerCreated`, `SubOrchestrationCreated`) in the same commit that
/// enqueues the work they describe. Only actions for positions not yet in
/// history are emitted; replayed decisions produce no action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorAction {
    /// Run an activity
    ScheduleActivity {
        /// Correlation id within the execution
        id: u64,

        /// Registered activity name
        name: String,

        input: Value,
    },

    /// Fire a timer at the given instant
    CreateTimer { id: u64, fire_at: DateTime<Utc> },

    /// Start a child orchestration
    StartSubOrchestration {
        id: u64,

        /// Registered orchestration name
        name: String,

        /// Instance id of the child
        instance_id: String,

        input: Value,
    },

    /// Orchestrator is suspended on an external event
    ///
    /// Informational: no work item is produced; the event arrives through
    /// `raise_event`.
    WaitForExternalEvent { name: String },

    /// Complete the execution with a result
    Complete { result: Value },

    /// Fail the execution
    Fail { error: FailureDetails },

    /// Restart the instance with fresh input and empty history
    ContinueAsNew { input: Value },
}

impl OrchestratorAction {
    /// Correlation id for scheduling actions
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::ScheduleActivity { id, .. }
            | Self::CreateTimer { id, .. }
            | Self::StartSubOrchestration { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Check if this action ends the execution
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete { .. } | Self::Fail { .. } | Self::ContinueAsNew { .. }
        )
    }
}
