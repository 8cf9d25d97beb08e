//! Orchestration context and replay state
//!
//! The context is the only way orchestrator code talks to the outside world.
//! Every call that needs an external result allocates the next correlation
//! id, checks it against history, and returns a [`DurableFuture`] that
//! resolves only when the matching completion event has been replayed.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use super::future::{TryWhenAll, TypedFuture, WhenAll, WhenAny};
use super::{OrchestrationError, OrchestratorAction, TaskError};
use crate::clock::add_duration;
use crate::engine::ReplayError;
use crate::history::{FailureDetails, HistoryEvent};
use crate::reliability::RetryPolicy;

/// Namespace for deterministic GUIDs handed out by [`OrchestrationContext::new_guid`]
const GUID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b4e_93a7_4d5e_8c0f_1a2b_3c4d_5e6f);

/// Result delivered for a correlation id
#[derive(Debug, Clone)]
pub(crate) enum Completion {
    Task(Result<Value, FailureDetails>),
    Timer,
    SubOrchestration(Result<Value, FailureDetails>),
    Event(Value),
}

/// Kind of decision an orchestrator can make
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecisionKind {
    Activity,
    Timer,
    SubOrchestration,
}

impl DecisionKind {
    fn describe(self, name: &str) -> String {
        match self {
            Self::Activity => format!("TaskScheduled({})", name),
            Self::Timer => "TimerCreated".to_string(),
            Self::SubOrchestration => format!("SubOrchestrationCreated({})", name),
        }
    }

    fn matches(self, recorded: &HistoryEvent, name: &str) -> bool {
        match (self, recorded) {
            (Self::Activity, HistoryEvent::TaskScheduled { name: n, .. }) => n == name,
            (Self::Timer, HistoryEvent::TimerCreated { .. }) => true,
            (Self::SubOrchestration, HistoryEvent::SubOrchestrationCreated { name: n, .. }) => {
                n == name
            }
            _ => false,
        }
    }
}

fn describe_recorded(event: &HistoryEvent) -> String {
    match event {
        HistoryEvent::TaskScheduled { name, .. } => format!("TaskScheduled({})", name),
        HistoryEvent::TimerCreated { .. } => "TimerCreated".to_string(),
        HistoryEvent::SubOrchestrationCreated { name, .. } => {
            format!("SubOrchestrationCreated({})", name)
        }
        other => other.event_type().to_string(),
    }
}

/// Mutable state shared between the engine and orchestrator futures
pub(crate) struct ReplayState {
    instance_id: String,
    execution_id: String,

    /// Decisions recorded in history, by correlation id
    recorded: BTreeMap<u64, HistoryEvent>,
    claimed: HashSet<u64>,
    names: HashMap<u64, String>,
    next_id: u64,

    completions: HashMap<u64, Completion>,
    wakers: HashMap<u64, Waker>,

    next_waiter: u64,
    /// Unresolved external event waiters, oldest first
    waiters: Vec<(u64, String)>,
    buffered_events: HashMap<String, VecDeque<Value>>,
    delivered_events: HashMap<u64, Value>,
    event_wakers: HashMap<u64, Waker>,

    actions: Vec<OrchestratorAction>,
    new_events: Vec<HistoryEvent>,

    current_time: DateTime<Utc>,
    is_replaying: bool,
    custom_status: Option<Value>,
    guid_counter: u64,
    continue_as_new: Option<Value>,
    fault: Option<ReplayError>,
}

impl ReplayState {
    fn record_fault(&mut self, fault: ReplayError) {
        if self.fault.is_none() {
            self.fault = Some(fault);
        }
    }

    /// Allocate the next id and either claim the recorded decision or emit a new one
    fn decide(
        &mut self,
        kind: DecisionKind,
        name: &str,
        build: impl FnOnce(u64) -> (HistoryEvent, OrchestratorAction),
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.names.insert(id, name.to_string());

        match self.recorded.get(&id) {
            Some(recorded) => {
                if !kind.matches(recorded, name) {
                    let fault = ReplayError::NonDeterminism {
                        id,
                        recorded: describe_recorded(recorded),
                        produced: kind.describe(name),
                    };
                    self.record_fault(fault);
                }
                self.claimed.insert(id);
            }
            None if self.is_replaying => {
                self.record_fault(ReplayError::NonDeterminism {
                    id,
                    recorded: "nothing".to_string(),
                    produced: kind.describe(name),
                });
            }
            None => {
                let (event, action) = build(id);
                self.new_events.push(event);
                self.actions.push(action);
            }
        }

        id
    }

    fn take_completion(&mut self, id: u64, waker: &Waker) -> Option<Completion> {
        match self.completions.remove(&id) {
            Some(completion) => Some(completion),
            None => {
                self.wakers.insert(id, waker.clone());
                None
            }
        }
    }

    fn take_event(&mut self, waiter: u64, waker: &Waker) -> Option<Value> {
        match self.delivered_events.remove(&waiter) {
            Some(value) => Some(value),
            None => {
                self.event_wakers.insert(waiter, waker.clone());
                None
            }
        }
    }

    fn register_waiter(&mut self, name: &str) -> u64 {
        let waiter = self.next_waiter;
        self.next_waiter += 1;

        let buffered = self
            .buffered_events
            .get_mut(name)
            .and_then(|queue| queue.pop_front());
        match buffered {
            Some(value) => {
                self.delivered_events.insert(waiter, value);
            }
            None => self.waiters.push((waiter, name.to_string())),
        }
        waiter
    }

    fn release_waiter(&mut self, waiter: u64, name: &str) {
        self.event_wakers.remove(&waiter);
        if let Some(pos) = self.waiters.iter().position(|(w, _)| *w == waiter) {
            self.waiters.remove(pos);
            return;
        }
        // Resolved but never observed: hand the event to the next waiter
        if let Some(value) = self.delivered_events.remove(&waiter) {
            self.buffered_events
                .entry(name.to_string())
                .or_default()
                .push_front(value);
        }
    }

    // =========================================================================
    // Engine-facing operations
    // =========================================================================

    pub(crate) fn set_time(&mut self, timestamp: DateTime<Utc>) {
        self.current_time = timestamp;
    }

    pub(crate) fn set_replaying(&mut self, replaying: bool) {
        self.is_replaying = replaying;
    }

    /// Make a completion visible; returns the waker of the future waiting on it
    pub(crate) fn deliver(&mut self, id: u64, completion: Completion) -> Option<Waker> {
        self.completions.insert(id, completion);
        self.wakers.remove(&id)
    }

    /// Route an external event to the oldest waiter with that name, or buffer it
    pub(crate) fn deliver_event(&mut self, name: &str, input: Value) -> Option<Waker> {
        match self.waiters.iter().position(|(_, n)| n == name) {
            Some(pos) => {
                let (waiter, _) = self.waiters.remove(pos);
                self.delivered_events.insert(waiter, input);
                self.event_wakers.remove(&waiter)
            }
            None => {
                self.buffered_events
                    .entry(name.to_string())
                    .or_default()
                    .push_back(input);
                None
            }
        }
    }

    pub(crate) fn fault(&self) -> Option<&ReplayError> {
        self.fault.as_ref()
    }

    pub(crate) fn take_fault(&mut self) -> Option<ReplayError> {
        self.fault.take()
    }

    pub(crate) fn continue_as_new_input(&self) -> Option<&Value> {
        self.continue_as_new.as_ref()
    }

    /// Recorded decisions that replay never reproduced
    pub(crate) fn unclaimed_decisions(&self) -> Option<ReplayError> {
        self.recorded
            .iter()
            .find(|(id, _)| !self.claimed.contains(id))
            .map(|(id, event)| ReplayError::NonDeterminism {
                id: *id,
                recorded: describe_recorded(event),
                produced: "nothing".to_string(),
            })
    }

    /// Drain what this turn produced
    pub(crate) fn take_output(&mut self) -> TurnOutput {
        let mut actions = std::mem::take(&mut self.actions);
        actions.extend(
            self.waiters
                .iter()
                .map(|(_, name)| OrchestratorAction::WaitForExternalEvent { name: name.clone() }),
        );
        TurnOutput {
            actions,
            new_events: std::mem::take(&mut self.new_events),
            custom_status: self.custom_status.take(),
        }
    }
}

/// Actions and events collected from orchestrator code during one turn
pub(crate) struct TurnOutput {
    pub(crate) actions: Vec<OrchestratorAction>,
    pub(crate) new_events: Vec<HistoryEvent>,
    pub(crate) custom_status: Option<Value>,
}

/// Handle given to orchestrator code
///
/// Cheap to clone; all clones share the same replay state.
///
/// # Example
///
/// ```ignore
/// async fn fan_out(ctx: OrchestrationContext, inputs: Vec<i64>) -> Result<i64, OrchestrationError> {
///     let tasks = inputs
///         .iter()
///         .map(|n| ctx.schedule_activity("square", json!(n)))
///         .collect::<Vec<_>>();
///
///     // All squares are scheduled together; results come back in input order
///     let squares = ctx.try_when_all(tasks).await?;
///
///     let sum = ctx.schedule_activity("sum", json!(squares)).await?;
///     Ok(serde_json::from_value(sum)?)
/// }
/// ```
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<ReplayState>>,
}

impl std::fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("OrchestrationContext")
            .field("instance_id", &state.instance_id)
            .field("execution_id", &state.execution_id)
            .field("is_replaying", &state.is_replaying)
            .finish()
    }
}

impl OrchestrationContext {
    pub(crate) fn new(
        instance_id: impl Into<String>,
        execution_id: impl Into<String>,
        recorded: BTreeMap<u64, HistoryEvent>,
        start_time: DateTime<Utc>,
    ) -> Self {
        let state = ReplayState {
            instance_id: instance_id.into(),
            execution_id: execution_id.into(),
            recorded,
            claimed: HashSet::new(),
            names: HashMap::new(),
            next_id: 0,
            completions: HashMap::new(),
            wakers: HashMap::new(),
            next_waiter: 0,
            waiters: Vec::new(),
            buffered_events: HashMap::new(),
            delivered_events: HashMap::new(),
            event_wakers: HashMap::new(),
            actions: Vec::new(),
            new_events: Vec::new(),
            current_time: start_time,
            is_replaying: false,
            custom_status: None,
            guid_counter: 0,
            continue_as_new: None,
            fault: None,
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ReplayState) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Instance id of the running orchestration
    pub fn instance_id(&self) -> String {
        self.inner.lock().instance_id.clone()
    }

    /// Execution id of the running orchestration
    pub fn execution_id(&self) -> String {
        self.inner.lock().execution_id.clone()
    }

    /// Deterministic current time
    ///
    /// The timestamp of the turn that is being replayed, never the system
    /// clock.
    pub fn current_time(&self) -> DateTime<Utc> {
        self.inner.lock().current_time
    }

    /// True while orchestrator code is re-running against recorded history
    ///
    /// Useful to suppress duplicate logging.
    pub fn is_replaying(&self) -> bool {
        self.inner.lock().is_replaying
    }

    /// Deterministic GUID, stable across replays
    pub fn new_guid(&self) -> Uuid {
        let mut state = self.inner.lock();
        let counter = state.guid_counter;
        state.guid_counter += 1;
        let name = format!("{}/{}/{}", state.instance_id, state.execution_id, counter);
        Uuid::new_v5(&GUID_NAMESPACE, name.as_bytes())
    }

    /// Publish a custom status, visible through `get_status`
    pub fn set_custom_status<T: Serialize>(&self, status: &T) -> Result<(), OrchestrationError> {
        let value = serde_json::to_value(status)?;
        self.inner.lock().custom_status = Some(value);
        Ok(())
    }

    // =========================================================================
    // Activities
    // =========================================================================

    /// Schedule an activity and get a future for its result
    ///
    /// The activity is scheduled when this is called, not when the future is
    /// first polled; creating several futures before awaiting any of them
    /// fans out.
    pub fn schedule_activity(
        &self,
        name: impl Into<String>,
        input: Value,
    ) -> DurableFuture<Result<Value, TaskError>> {
        let name = name.into();
        let id = self.inner.lock().decide(DecisionKind::Activity, &name, |id| {
            (
                HistoryEvent::TaskScheduled {
                    id,
                    name: name.clone(),
                    input: input.clone(),
                },
                OrchestratorAction::ScheduleActivity {
                    id,
                    name: name.clone(),
                    input,
                },
            )
        });
        DurableFuture::decision(self.clone(), id, name, resolve_task)
    }

    /// Schedule an activity with typed input and output
    pub fn schedule_activity_typed<I, O>(
        &self,
        name: impl Into<String>,
        input: &I,
    ) -> Result<TypedFuture<O>, OrchestrationError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let input = serde_json::to_value(input)?;
        Ok(TypedFuture::new(self.schedule_activity(name, input)))
    }

    /// Schedule an activity, re-scheduling it on failure per `policy`
    ///
    /// Retries are ordinary history: each attempt is its own `TaskScheduled`
    /// and the backoff between attempts is a durable timer. Jitter is never
    /// applied.
    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: Value,
        policy: RetryPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send + 'static>> {
        let ctx = self.clone();
        let name = name.into();
        Box::pin(async move {
            let mut attempt = 1;
            loop {
                match ctx.schedule_activity(name.clone(), input.clone()).await {
                    Ok(value) => return Ok(value),
                    Err(err) => {
                        if !policy.allows_retry(err.error_type(), attempt) {
                            return Err(err);
                        }
                        attempt += 1;
                        let delay = policy.backoff(attempt);
                        if !delay.is_zero() {
                            ctx.create_timer_after(delay).await;
                        }
                    }
                }
            }
        })
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Create a durable timer that fires at `fire_at`
    pub fn create_timer(&self, fire_at: DateTime<Utc>) -> DurableFuture<()> {
        let id = self.inner.lock().decide(DecisionKind::Timer, "timer", |id| {
            (
                HistoryEvent::TimerCreated { id, fire_at },
                OrchestratorAction::CreateTimer { id, fire_at },
            )
        });
        DurableFuture::decision(self.clone(), id, "timer".to_string(), |_| ())
    }

    /// Create a durable timer relative to the deterministic current time
    pub fn create_timer_after(&self, delay: Duration) -> DurableFuture<()> {
        let fire_at = add_duration(self.current_time(), delay);
        self.create_timer(fire_at)
    }

    // =========================================================================
    // External events
    // =========================================================================

    /// Wait for an event raised through the client
    ///
    /// Events are matched by name in arrival order. An event raised before
    /// anyone waits on it is kept until the next wait with that name.
    pub fn wait_for_external_event(&self, name: impl Into<String>) -> DurableFuture<Value> {
        let name = name.into();
        let waiter = self.inner.lock().register_waiter(&name);
        DurableFuture {
            ctx: self.clone(),
            slot: Slot::Event { waiter },
            name,
            resolve: resolve_event,
            done: false,
            _output: PhantomData,
        }
    }

    // =========================================================================
    // Sub-orchestrations
    // =========================================================================

    /// Start a child orchestration with a derived instance id
    pub fn create_sub_orchestration(
        &self,
        name: impl Into<String>,
        input: Value,
    ) -> DurableFuture<Result<Value, TaskError>> {
        let child_instance = {
            let state = self.inner.lock();
            format!(
                "{}::{}::{}",
                state.instance_id, state.execution_id, state.next_id
            )
        };
        self.create_sub_orchestration_with_id(name, child_instance, input)
    }

    /// Start a child orchestration with an explicit instance id
    pub fn create_sub_orchestration_with_id(
        &self,
        name: impl Into<String>,
        instance_id: impl Into<String>,
        input: Value,
    ) -> DurableFuture<Result<Value, TaskError>> {
        let name = name.into();
        let instance_id = instance_id.into();
        let id = self
            .inner
            .lock()
            .decide(DecisionKind::SubOrchestration, &name, |id| {
                (
                    HistoryEvent::SubOrchestrationCreated {
                        id,
                        name: name.clone(),
                        instance_id: instance_id.clone(),
                        input: input.clone(),
                    },
                    OrchestratorAction::StartSubOrchestration {
                        id,
                        name: name.clone(),
                        instance_id,
                        input,
                    },
                )
            });
        DurableFuture::decision(self.clone(), id, name, resolve_task)
    }

    /// Start a child orchestration with typed input and output
    pub fn create_sub_orchestration_typed<I, O>(
        &self,
        name: impl Into<String>,
        input: &I,
    ) -> Result<TypedFuture<O>, OrchestrationError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let input = serde_json::to_value(input)?;
        Ok(TypedFuture::new(self.create_sub_orchestration(name, input)))
    }

    // =========================================================================
    // ContinueAsNew
    // =========================================================================

    /// End this execution and start a fresh one with `input`
    ///
    /// The returned future never resolves; `return ctx.continue_as_new(..).await`
    /// is the intended use.
    pub fn continue_as_new<T>(&self, input: Value) -> std::future::Pending<T> {
        let mut state = self.inner.lock();
        if state.continue_as_new.is_some() {
            warn!(instance_id = %state.instance_id, "continue_as_new called twice, keeping first input");
        } else {
            state.continue_as_new = Some(input);
        }
        std::future::pending()
    }

    // =========================================================================
    // Joins
    // =========================================================================

    /// Wait for all futures; results are in input order
    pub fn when_all<F: Future>(&self, futures: Vec<F>) -> WhenAll<F> {
        WhenAll::new(futures)
    }

    /// Wait for all futures; fail with every error if any task failed
    pub fn try_when_all<F, T>(&self, futures: Vec<F>) -> TryWhenAll<F>
    where
        F: Future<Output = Result<T, TaskError>>,
    {
        TryWhenAll::new(futures)
    }

    /// Wait for the first future to complete; yields its index and output
    pub fn when_any<F: Future>(&self, futures: Vec<F>) -> WhenAny<F> {
        WhenAny::new(futures)
    }
}

// =============================================================================
// DurableFuture
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Slot {
    Decision { id: u64 },
    Event { waiter: u64 },
}

/// Completion handed to a future's resolver
pub(crate) struct Resolved {
    id: u64,
    name: String,
    completion: Completion,
}

fn resolve_task(resolved: Resolved) -> Result<Value, TaskError> {
    let failure = match resolved.completion {
        Completion::Task(Ok(value)) | Completion::SubOrchestration(Ok(value)) => {
            return Ok(value)
        }
        Completion::Task(Err(failure)) | Completion::SubOrchestration(Err(failure)) => failure,
        other => FailureDetails::new(
            crate::history::error_types::NON_DETERMINISTIC_REPLAY,
            format!("unexpected completion {:?}", other),
        ),
    };
    Err(TaskError {
        task_id: resolved.id,
        name: resolved.name,
        failure,
    })
}

fn resolve_event(resolved: Resolved) -> Value {
    match resolved.completion {
        Completion::Event(value) => value,
        _ => Value::Null,
    }
}

/// Future for one durable operation
///
/// Resolves only once the matching completion event has been replayed;
/// until then it is `Pending` and the orchestrator is suspended.
pub struct DurableFuture<T> {
    ctx: OrchestrationContext,
    slot: Slot,
    name: String,
    resolve: fn(Resolved) -> T,
    done: bool,
    _output: PhantomData<fn() -> T>,
}

impl<T> DurableFuture<T> {
    fn decision(
        ctx: OrchestrationContext,
        id: u64,
        name: String,
        resolve: fn(Resolved) -> T,
    ) -> Self {
        Self {
            ctx,
            slot: Slot::Decision { id },
            name,
            resolve,
            done: false,
            _output: PhantomData,
        }
    }

    /// Correlation id, or `None` for external event waits
    pub fn id(&self) -> Option<u64> {
        match self.slot {
            Slot::Decision { id } => Some(id),
            Slot::Event { .. } => None,
        }
    }

    /// Activity, orchestration or event name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> std::fmt::Debug for DurableFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableFuture")
            .field("slot", &self.slot)
            .field("name", &self.name)
            .field("done", &self.done)
            .finish()
    }
}

impl<T> Future for DurableFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        if this.done {
            return Poll::Pending;
        }

        let completion = this.ctx.with_state(|state| match this.slot {
            Slot::Decision { id } => state.take_completion(id, cx.waker()),
            Slot::Event { waiter } => state.take_event(waiter, cx.waker()).map(Completion::Event),
        });

        match completion {
            Some(completion) => {
                this.done = true;
                let id = match this.slot {
                    Slot::Decision { id } => id,
                    Slot::Event { waiter } => waiter,
                };
                Poll::Ready((this.resolve)(Resolved {
                    id,
                    name: this.name.clone(),
                    completion,
                }))
            }
            None => Poll::Pending,
        }
    }
}

impl<T> Drop for DurableFuture<T> {
    fn drop(&mut self) {
        if let (Slot::Event { waiter }, false) = (self.slot, self.done) {
            let name = std::mem::take(&mut self.name);
            self.ctx
                .with_state(|state| state.release_waiter(waiter, &name));
        }
    }
}
