//! Replay engine
//!
//! Re-runs orchestrator code against an instance's history to compute the
//! next batch of actions. One call is one "turn": the recorded history of the
//! current execution plus the newly delivered messages go in, and the events
//! to append, the actions to carry out and the outcome come out.
//!
//! The orchestrator future is polled with a no-op waker after every event on
//! the cursor. Durable futures resolve only when the matching completion has
//! been delivered, so `Poll::Pending` after the last event means the
//! orchestrator is suspended.

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::task::noop_waker_ref;
use serde_json::Value;
use tracing::{debug, warn};

use super::registry::{AnyOrchestrator, OrchestrationFuture};
use crate::history::{error_types, FailureDetails, HistoryEvent};
use crate::orchestration::{Completion, OrchestrationContext, OrchestrationError, OrchestratorAction};

/// Errors from the replay engine
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplayError {
    /// Orchestrator code diverged from recorded history
    #[error("non-deterministic replay at id {id}: history has {recorded}, orchestrator produced {produced}")]
    NonDeterminism {
        id: u64,
        recorded: String,
        produced: String,
    },

    /// Neither history nor the new messages start the execution
    #[error("execution {0} has no ExecutionStarted event")]
    MissingExecutionStarted(String),
}

impl From<ReplayError> for FailureDetails {
    fn from(err: ReplayError) -> Self {
        let error_type = match err {
            ReplayError::NonDeterminism { .. } => error_types::NON_DETERMINISTIC_REPLAY,
            ReplayError::MissingExecutionStarted(_) => error_types::ORCHESTRATION_FAILED,
        };
        FailureDetails::new(error_type, err.to_string())
    }
}

/// Input to one replay turn
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub instance_id: String,
    pub execution_id: String,

    /// Recorded history of the current execution
    pub history: Vec<HistoryEvent>,

    /// Newly delivered messages, in enqueue order
    pub messages: Vec<HistoryEvent>,

    /// Timestamp recorded in this turn's `OrchestratorStarted`
    pub now: DateTime<Utc>,
}

/// How a turn ended
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Waiting on completions that are not in history yet
    Suspended,

    /// Orchestrator returned a value
    Completed(Value),

    /// Orchestrator returned an error, panicked or diverged from history
    Failed(FailureDetails),

    /// Orchestrator asked to restart with new input
    ContinuedAsNew(Value),

    /// Instance was terminated with a reason
    Terminated(String),
}

impl TurnOutcome {
    /// Check if the execution ended in this turn
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Suspended)
    }
}

/// Output of one replay turn
#[derive(Debug, Clone)]
pub struct TurnResult {
    /// Events to append to history, in order
    pub history_delta: Vec<HistoryEvent>,

    /// New actions; replayed decisions produce none
    pub actions: Vec<OrchestratorAction>,

    pub outcome: TurnOutcome,

    /// Custom status set by orchestrator code during this turn
    pub custom_status: Option<Value>,
}

impl TurnResult {
    fn empty() -> Self {
        Self {
            history_delta: Vec::new(),
            actions: Vec::new(),
            outcome: TurnOutcome::Suspended,
            custom_status: None,
        }
    }

    /// Check if nothing in the delivered messages was relevant
    pub fn is_empty(&self) -> bool {
        self.history_delta.is_empty()
    }
}

/// Drives orchestrator code through replay
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplayEngine;

impl ReplayEngine {
    pub fn new() -> Self {
        Self
    }

    /// Run one turn of an orchestration
    pub fn run_turn(
        &self,
        orchestrator: &dyn AnyOrchestrator,
        request: TurnRequest,
    ) -> Result<TurnResult, ReplayError> {
        let TurnRequest {
            instance_id,
            execution_id,
            history,
            messages,
            now,
        } = request;

        let accepted = filter_messages(&instance_id, &history, messages);
        if accepted.is_empty() {
            debug!(instance_id = %instance_id, "No relevant messages, nothing to replay");
            return Ok(TurnResult::empty());
        }

        let first_turn = history.is_empty();
        let mut delta = Vec::with_capacity(accepted.events.len() + 2);
        if first_turn {
            match accepted.started {
                Some(started) => delta.push(started),
                None => return Err(ReplayError::MissingExecutionStarted(execution_id)),
            }
        }
        delta.push(HistoryEvent::OrchestratorStarted { timestamp: now });

        if let Some(reason) = accepted.terminated {
            delta.push(HistoryEvent::ExecutionTerminated {
                reason: reason.clone(),
            });
            return Ok(TurnResult {
                history_delta: delta,
                actions: Vec::new(),
                outcome: TurnOutcome::Terminated(reason),
                custom_status: None,
            });
        }
        delta.extend(accepted.events);

        let start_time = history
            .iter()
            .find_map(|event| match event {
                HistoryEvent::OrchestratorStarted { timestamp } => Some(*timestamp),
                _ => None,
            })
            .unwrap_or(now);
        let ctx = OrchestrationContext::new(
            instance_id.clone(),
            execution_id,
            recorded_decisions(&history),
            start_time,
        );

        let past_len = history.len();
        let mut orchestrator_future: Option<OrchestrationFuture> = None;
        let mut finished: Option<Finish> = None;

        for (index, event) in history.iter().chain(delta.iter()).enumerate() {
            ctx.with_state(|state| state.set_replaying(index < past_len));
            apply_event(&ctx, orchestrator, &mut orchestrator_future, event);

            if finished.is_some() {
                continue;
            }
            let Some(fut) = orchestrator_future.as_mut() else {
                continue;
            };
            finished = poll_step(&ctx, fut);
        }

        if !matches!(finished, Some(Finish::Fault(_))) {
            if let Some(fault) = ctx.with_state(|state| state.unclaimed_decisions()) {
                finished = Some(Finish::Fault(fault.into()));
            }
        }

        let output = ctx.with_state(|state| state.take_output());
        let mut actions = output.actions;

        let outcome = match finished {
            None => {
                delta.extend(output.new_events);
                TurnOutcome::Suspended
            }
            Some(Finish::Returned(Ok(result))) => {
                delta.extend(output.new_events);
                delta.push(HistoryEvent::ExecutionCompleted {
                    result: result.clone(),
                });
                actions.push(OrchestratorAction::Complete {
                    result: result.clone(),
                });
                TurnOutcome::Completed(result)
            }
            Some(Finish::Returned(Err(err))) => {
                let failure: FailureDetails = err.into();
                delta.extend(output.new_events);
                delta.push(HistoryEvent::ExecutionFailed {
                    error: failure.clone(),
                });
                actions.push(OrchestratorAction::Fail {
                    error: failure.clone(),
                });
                TurnOutcome::Failed(failure)
            }
            Some(Finish::ContinueAsNew(input)) => {
                delta.extend(output.new_events);
                delta.push(HistoryEvent::ContinueAsNew {
                    input: input.clone(),
                });
                actions.push(OrchestratorAction::ContinueAsNew {
                    input: input.clone(),
                });
                TurnOutcome::ContinuedAsNew(input)
            }
            Some(Finish::Fault(failure)) => {
                warn!(
                    instance_id = %instance_id,
                    error_type = %failure.error_type,
                    "Orchestration failed during replay: {}",
                    failure.message
                );
                delta.push(HistoryEvent::ExecutionFailed {
                    error: failure.clone(),
                });
                actions = vec![OrchestratorAction::Fail {
                    error: failure.clone(),
                }];
                TurnOutcome::Failed(failure)
            }
        };

        Ok(TurnResult {
            history_delta: delta,
            actions,
            outcome,
            custom_status: output.custom_status,
        })
    }
}

/// Reason polling stopped before the cursor ran out
enum Finish {
    Returned(Result<Value, OrchestrationError>),
    ContinueAsNew(Value),
    Fault(FailureDetails),
}

/// Messages that survived filtering
#[derive(Default)]
struct AcceptedMessages {
    started: Option<HistoryEvent>,
    terminated: Option<String>,
    events: Vec<HistoryEvent>,
}

impl AcceptedMessages {
    fn is_empty(&self) -> bool {
        self.started.is_none() && self.terminated.is_none() && self.events.is_empty()
    }
}

fn filter_messages(
    instance_id: &str,
    history: &[HistoryEvent],
    messages: Vec<HistoryEvent>,
) -> AcceptedMessages {
    let decisions = recorded_decisions(history);
    let mut completed: HashSet<u64> = history
        .iter()
        .filter(|event| event.is_completion())
        .filter_map(HistoryEvent::correlation_id)
        .collect();

    let mut accepted = AcceptedMessages::default();
    for message in messages {
        match &message {
            HistoryEvent::ExecutionStarted { .. } => {
                if history.is_empty() && accepted.started.is_none() {
                    accepted.started = Some(message);
                } else {
                    warn!(instance_id = %instance_id, "Discarding duplicate ExecutionStarted");
                }
            }
            HistoryEvent::ExecutionTerminated { reason } => {
                if accepted.terminated.is_none() {
                    accepted.terminated = Some(reason.clone());
                }
            }
            HistoryEvent::EventRaised { .. } => accepted.events.push(message),
            event if event.is_completion() => {
                let relevant = event
                    .correlation_id()
                    .and_then(|id| decisions.get(&id).map(|decision| (id, decision)))
                    .filter(|(id, decision)| event.completes(decision) && !completed.contains(id));

                match relevant {
                    Some((id, _)) => {
                        completed.insert(id);
                        accepted.events.push(message);
                    }
                    None => warn!(
                        instance_id = %instance_id,
                        event_type = event.event_type(),
                        id = ?event.correlation_id(),
                        "Discarding completion with unknown or already completed id"
                    ),
                }
            }
            other => warn!(
                instance_id = %instance_id,
                event_type = other.event_type(),
                "Discarding unexpected message"
            ),
        }
    }
    accepted
}

/// Scheduling decisions recorded in history, by correlation id
fn recorded_decisions(history: &[HistoryEvent]) -> BTreeMap<u64, HistoryEvent> {
    history
        .iter()
        .filter(|event| event.is_decision())
        .filter_map(|event| event.correlation_id().map(|id| (id, event.clone())))
        .collect()
}

fn apply_event(
    ctx: &OrchestrationContext,
    orchestrator: &dyn AnyOrchestrator,
    orchestrator_future: &mut Option<OrchestrationFuture>,
    event: &HistoryEvent,
) {
    let waker = match event {
        HistoryEvent::ExecutionStarted { input, .. } => {
            *orchestrator_future = Some(orchestrator.start(ctx.clone(), input.clone()));
            None
        }
        HistoryEvent::OrchestratorStarted { timestamp } => {
            ctx.with_state(|state| state.set_time(*timestamp));
            None
        }
        HistoryEvent::TaskCompleted { id, result } => {
            ctx.with_state(|state| state.deliver(*id, Completion::Task(Ok(result.clone()))))
        }
        HistoryEvent::TaskFailed { id, error } => {
            ctx.with_state(|state| state.deliver(*id, Completion::Task(Err(error.clone()))))
        }
        HistoryEvent::TimerFired { id, .. } => {
            ctx.with_state(|state| state.deliver(*id, Completion::Timer))
        }
        HistoryEvent::SubOrchestrationCompleted { id, result } => ctx.with_state(|state| {
            state.deliver(*id, Completion::SubOrchestration(Ok(result.clone())))
        }),
        HistoryEvent::SubOrchestrationFailed { id, error } => ctx.with_state(|state| {
            state.deliver(*id, Completion::SubOrchestration(Err(error.clone())))
        }),
        HistoryEvent::EventRaised { name, input } => {
            ctx.with_state(|state| state.deliver_event(name, input.clone()))
        }
        _ => None,
    };

    if let Some(waker) = waker {
        waker.wake();
    }
}

fn poll_step(ctx: &OrchestrationContext, fut: &mut OrchestrationFuture) -> Option<Finish> {
    let mut cx = Context::from_waker(noop_waker_ref());
    let polled = std::panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx)));

    let polled = match polled {
        Ok(polled) => polled,
        Err(payload) => {
            return Some(Finish::Fault(FailureDetails::new(
                error_types::ORCHESTRATOR_PANICKED,
                panic_message(payload.as_ref(), "orchestrator panicked"),
            )))
        }
    };

    if let Some(fault) = ctx.with_state(|state| state.take_fault()) {
        return Some(Finish::Fault(fault.into()));
    }
    if let Some(input) = ctx.with_state(|state| state.continue_as_new_input().cloned()) {
        return Some(Finish::ContinueAsNew(input));
    }

    match polled {
        Poll::Ready(result) => Some(Finish::Returned(result)),
        Poll::Pending => None,
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send), fallback: &str) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        fallback.to_string()
    }
}
