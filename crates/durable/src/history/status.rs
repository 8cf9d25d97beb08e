//! Orchestration status and instance state

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{FailureDetails, ParentLink};

/// Orchestration status
///
/// Status only moves forward. `Completed`, `Failed` and `Terminated` are
/// terminal; `ContinuedAsNew` is left only by starting the next execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    /// Instance created, first turn not yet committed
    Pending,

    /// At least one turn committed, waiting on work
    Running,

    /// Orchestrator returned a value
    Completed,

    /// Orchestrator returned an error, or the runtime failed it
    Failed,

    /// Terminated via the client
    Terminated,

    /// Execution ended with ContinueAsNew; the next execution is queued
    ContinuedAsNew,
}

impl OrchestrationStatus {
    /// Check if no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }

    /// Check whether moving to `next` is allowed
    pub fn can_transition_to(self, next: Self) -> bool {
        use OrchestrationStatus::*;

        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (Pending, _) => true,
            (Running, Pending) => false,
            (Running, _) => true,
            (ContinuedAsNew, Running)
            | (ContinuedAsNew, ContinuedAsNew)
            | (ContinuedAsNew, Completed)
            | (ContinuedAsNew, Failed)
            | (ContinuedAsNew, Terminated) => true,
            (ContinuedAsNew, Pending) => false,
            _ => false,
        }
    }

    /// Database representation
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
            Self::ContinuedAsNew => "continued_as_new",
        }
    }
}

impl std::fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrchestrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            "continued_as_new" => Ok(Self::ContinuedAsNew),
            other => Err(format!("unknown orchestration status: {}", other)),
        }
    }
}

/// Identity of one execution of an orchestration instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrchestrationInstance {
    pub instance_id: String,
    pub execution_id: String,
}

/// Row of the instance table, as reported by `get_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub instance_id: String,

    /// Current execution; changes on ContinueAsNew
    pub execution_id: String,

    /// Registered orchestration name
    pub name: String,

    pub status: OrchestrationStatus,

    pub input: Value,

    /// Result for `Completed`, termination reason for `Terminated`
    pub output: Option<Value>,

    pub custom_status: Option<Value>,

    /// Failure payload for `Failed`
    pub failure: Option<FailureDetails>,

    /// Set for sub-orchestrations
    pub parent: Option<ParentLink>,

    /// Number of events in the current execution's history
    pub history_length: i64,

    pub created_at: DateTime<Utc>,

    pub last_updated_at: DateTime<Utc>,
}

impl InstanceState {
    /// Identity of the current execution
    pub fn instance(&self) -> OrchestrationInstance {
        OrchestrationInstance {
            instance_id: self.instance_id.clone(),
            execution_id: self.execution_id.clone(),
        }
    }

    /// Deserialize the output into a concrete type
    pub fn output_as<T: serde::de::DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.output.clone().map(serde_json::from_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(OrchestrationStatus::Completed.is_terminal());
        assert!(OrchestrationStatus::Failed.is_terminal());
        assert!(OrchestrationStatus::Terminated.is_terminal());
        assert!(!OrchestrationStatus::Running.is_terminal());
        assert!(!OrchestrationStatus::ContinuedAsNew.is_terminal());
    }

    #[test]
    fn test_status_never_regresses() {
        use OrchestrationStatus::*;

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Completed));
        assert!(Running.can_transition_to(Running));
        assert!(Running.can_transition_to(ContinuedAsNew));
        assert!(ContinuedAsNew.can_transition_to(Running));

        assert!(!Running.can_transition_to(Pending));
        assert!(!ContinuedAsNew.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Terminated.can_transition_to(Terminated));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            OrchestrationStatus::Pending,
            OrchestrationStatus::Running,
            OrchestrationStatus::Completed,
            OrchestrationStatus::Failed,
            OrchestrationStatus::Terminated,
            OrchestrationStatus::ContinuedAsNew,
        ] {
            assert_eq!(status.as_str().parse::<OrchestrationStatus>(), Ok(status));
        }
        assert!("bogus".parse::<OrchestrationStatus>().is_err());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&OrchestrationStatus::ContinuedAsNew).unwrap();
        assert_eq!(json, "\"continued_as_new\"");
    }
}
