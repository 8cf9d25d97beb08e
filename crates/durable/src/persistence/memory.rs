//! In-memory implementation of TaskHubStore for testing
//!
//! All state lives behind one mutex. Each commit is staged on a copy of the
//! state and swapped in only if every step succeeds, which gives the same
//! all-or-nothing behavior as a database transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::store::{apply_instance_update, StoreError, TaskHubStore};
use super::work_item::*;
use crate::clock::{add_duration, Clock, SystemClock};
use crate::history::{
    HistoryEvent, InstanceState, OrchestrationStatus, RecordedEvent,
};

#[derive(Debug, Clone)]
struct QueuedMessage {
    message: OrchestratorMessage,
    visible_at: DateTime<Utc>,
    lock_token: Option<Uuid>,
    dequeue_count: u32,
}

#[derive(Debug, Clone)]
struct QueuedActivity {
    id: Uuid,
    request: ActivityRequest,
    visible_at: DateTime<Utc>,
    lease: Option<Lease>,
    dequeue_count: u32,
}

#[derive(Debug, Clone)]
struct StoredTimer {
    id: Uuid,
    request: TimerRequest,
    visible_at: DateTime<Utc>,
    fired: bool,
    lease: Option<Lease>,
    dequeue_count: u32,
}

fn lease_is_live(lease: &Option<Lease>, now: DateTime<Utc>) -> bool {
    lease.as_ref().map_or(false, |l| l.expires_at > now)
}

fn holds(lease: &Option<Lease>, presented: &Lease, now: DateTime<Utc>) -> bool {
    lease
        .as_ref()
        .map_or(false, |l| l.token == presented.token && l.expires_at > now)
}

#[derive(Debug, Clone, Default)]
struct HubState {
    instances: HashMap<String, InstanceState>,

    /// History by (instance, execution)
    history: HashMap<(String, String), Vec<RecordedEvent>>,

    /// Instance locks held by orchestrator leases
    locks: HashMap<String, Lease>,

    messages: BTreeMap<u64, QueuedMessage>,
    activities: BTreeMap<u64, QueuedActivity>,
    timers: BTreeMap<u64, StoredTimer>,
    dead_letters: Vec<DeadLetterEntry>,
    next_seq: u64,
}

impl HubState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn insert_instance(&mut self, instance: &NewInstance, now: DateTime<Utc>) {
        self.instances.insert(
            instance.instance_id.clone(),
            InstanceState {
                instance_id: instance.instance_id.clone(),
                execution_id: instance.execution_id.clone(),
                name: instance.name.clone(),
                status: OrchestrationStatus::Pending,
                input: instance.input.clone(),
                output: None,
                custom_status: None,
                failure: None,
                parent: instance.parent.clone(),
                history_length: 0,
                created_at: now,
                last_updated_at: now,
            },
        );
    }

    /// Remove an instance and everything that belongs to it
    fn remove_instance(&mut self, instance_id: &str) {
        self.instances.remove(instance_id);
        self.locks.remove(instance_id);
        self.history.retain(|(id, _), _| id != instance_id);
        self.messages
            .retain(|_, m| m.message.instance_id != instance_id);
        self.activities
            .retain(|_, a| a.request.instance_id != instance_id);
        self.timers.retain(|_, t| t.request.instance_id != instance_id);
        self.dead_letters.retain(|d| d.instance_id != instance_id);
    }

    fn push_message(&mut self, message: OrchestratorMessage, now: DateTime<Utc>) {
        if let HistoryEvent::ExecutionStarted {
            name,
            input,
            parent,
        } = &message.event
        {
            if let Some(existing) = self.instances.get(&message.instance_id) {
                if let Some(rejection) = message.rejected_sub_orchestration(&existing.execution_id)
                {
                    debug!(instance_id = %message.instance_id, "sub-orchestration id already in use");
                    self.push_message(rejection, now);
                    return;
                }
            } else {
                let instance = NewInstance {
                    instance_id: message.instance_id.clone(),
                    execution_id: message
                        .execution_id
                        .clone()
                        .unwrap_or_else(|| Uuid::now_v7().to_string()),
                    name: name.clone(),
                    input: input.clone(),
                    parent: parent.clone(),
                };
                self.insert_instance(&instance, now);
            }
        }

        let seq = self.next_seq();
        self.messages.insert(
            seq,
            QueuedMessage {
                message,
                visible_at: now,
                lock_token: None,
                dequeue_count: 0,
            },
        );
    }

    fn push_activity(&mut self, request: ActivityRequest, now: DateTime<Utc>) {
        let seq = self.next_seq();
        self.activities.insert(
            seq,
            QueuedActivity {
                id: Uuid::now_v7(),
                request,
                visible_at: now,
                lease: None,
                dequeue_count: 0,
            },
        );
    }

    fn push_timer(&mut self, request: TimerRequest, now: DateTime<Utc>) {
        let exists = self.timers.values().any(|t| {
            t.request.instance_id == request.instance_id
                && t.request.execution_id == request.execution_id
                && t.request.timer_id == request.timer_id
        });
        if exists {
            return;
        }

        let seq = self.next_seq();
        self.timers.insert(
            seq,
            StoredTimer {
                id: Uuid::now_v7(),
                request,
                visible_at: now,
                fired: false,
                lease: None,
                dequeue_count: 0,
            },
        );
    }

    fn push_downstream(&mut self, batch: CommitBatch, now: DateTime<Utc>) {
        for message in batch.orchestrator_messages {
            self.push_message(message, now);
        }
        for request in batch.activities {
            self.push_activity(request, now);
        }
        for request in batch.timers {
            self.push_timer(request, now);
        }
    }

    fn current_history(&self, instance_id: &str) -> Vec<RecordedEvent> {
        self.instances
            .get(instance_id)
            .and_then(|state| {
                self.history
                    .get(&(instance_id.to_string(), state.execution_id.clone()))
            })
            .cloned()
            .unwrap_or_default()
    }

    // =========================================================================
    // Leasing
    // =========================================================================

    fn lease_orchestrator(
        &mut self,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Option<OrchestratorWorkItem> {
        let locks = &self.locks;
        let instance_id = self
            .messages
            .values()
            .filter(|m| m.visible_at <= now)
            .map(|m| &m.message.instance_id)
            .find(|id| !locks.get(*id).map_or(false, |l| l.expires_at > now))?
            .clone();

        let lease = Lease {
            token: Uuid::now_v7(),
            owner: worker_id.to_string(),
            expires_at: add_duration(now, lease_duration),
        };
        self.locks.insert(instance_id.clone(), lease.clone());

        let mut messages = Vec::new();
        let mut dequeue_count = 0;
        for queued in self
            .messages
            .values_mut()
            .filter(|m| m.message.instance_id == instance_id && m.visible_at <= now)
        {
            queued.lock_token = Some(lease.token);
            queued.dequeue_count += 1;
            dequeue_count = dequeue_count.max(queued.dequeue_count);
            messages.push(queued.message.clone());
        }

        Some(OrchestratorWorkItem {
            state: self.instances.get(&instance_id).cloned(),
            history: self.current_history(&instance_id),
            instance_id,
            messages,
            lease,
            dequeue_count,
        })
    }

    fn lease_activity(
        &mut self,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Option<ActivityWorkItem> {
        let queued = self
            .activities
            .values_mut()
            .find(|a| a.visible_at <= now && !lease_is_live(&a.lease, now))?;

        let lease = Lease {
            token: Uuid::now_v7(),
            owner: worker_id.to_string(),
            expires_at: add_duration(now, lease_duration),
        };
        queued.lease = Some(lease.clone());
        queued.dequeue_count += 1;

        Some(ActivityWorkItem {
            id: queued.id,
            request: queued.request.clone(),
            lease,
            dequeue_count: queued.dequeue_count,
        })
    }

    fn lease_timer(
        &mut self,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Option<TimerWorkItem> {
        let seq = self
            .timers
            .iter()
            .filter(|(_, t)| {
                !t.fired
                    && t.request.fire_at <= now
                    && t.visible_at <= now
                    && !lease_is_live(&t.lease, now)
            })
            .min_by_key(|(seq, t)| (t.request.fire_at, **seq))
            .map(|(seq, _)| *seq)?;
        let timer = self.timers.get_mut(&seq)?;

        let lease = Lease {
            token: Uuid::now_v7(),
            owner: worker_id.to_string(),
            expires_at: add_duration(now, lease_duration),
        };
        timer.lease = Some(lease.clone());
        timer.dequeue_count += 1;

        Some(TimerWorkItem {
            id: timer.id,
            request: timer.request.clone(),
            lease,
            dequeue_count: timer.dequeue_count,
        })
    }

    // =========================================================================
    // Lease checks
    // =========================================================================

    fn check_instance_lock(
        &self,
        instance_id: &str,
        lease: &Lease,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match self.locks.get(instance_id) {
            Some(held) if held.token == lease.token && held.expires_at > now => Ok(()),
            _ => Err(StoreError::LeaseLost),
        }
    }

    fn activity_seq(&self, id: Uuid, lease: &Lease, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.activities
            .iter()
            .find(|(_, a)| a.id == id && holds(&a.lease, lease, now))
            .map(|(seq, _)| *seq)
            .ok_or(StoreError::LeaseLost)
    }

    fn timer_seq(&self, id: Uuid, lease: &Lease, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.timers
            .iter()
            .find(|(_, t)| t.id == id && !t.fired && holds(&t.lease, lease, now))
            .map(|(seq, _)| *seq)
            .ok_or(StoreError::LeaseLost)
    }

    // =========================================================================
    // Commit
    // =========================================================================

    fn commit_orchestrator(
        &mut self,
        item: &OrchestratorWorkItem,
        batch: CommitBatch,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_instance_lock(&item.instance_id, &item.lease, now)?;

        if let Some(snapshot) = &item.state {
            let current = self
                .instances
                .get(&item.instance_id)
                .ok_or_else(|| StoreError::InstanceNotFound(item.instance_id.clone()))?;
            if current.history_length != snapshot.history_length
                || current.execution_id != snapshot.execution_id
            {
                return Err(StoreError::ConcurrencyConflict {
                    expected: snapshot.history_length,
                    actual: current.history_length,
                });
            }
        }

        let CommitBatch {
            history,
            instance_update,
            orchestrator_messages,
            activities,
            timers,
        } = batch;

        if !history.is_empty() || instance_update.is_some() {
            let instance = self
                .instances
                .get_mut(&item.instance_id)
                .ok_or_else(|| StoreError::InstanceNotFound(item.instance_id.clone()))?;

            let log = self
                .history
                .entry((instance.instance_id.clone(), instance.execution_id.clone()))
                .or_default();
            for event in history {
                log.push(RecordedEvent {
                    sequence: instance.history_length,
                    timestamp: now,
                    event,
                });
                instance.history_length += 1;
            }

            if let Some(update) = instance_update {
                apply_instance_update(instance, update)?;
            }
            instance.last_updated_at = now;
        }

        let token = item.lease.token;
        self.messages
            .retain(|_, m| m.lock_token != Some(token));
        self.locks.remove(&item.instance_id);

        self.push_downstream(
            CommitBatch {
                orchestrator_messages,
                activities,
                timers,
                ..CommitBatch::default()
            },
            now,
        );
        Ok(())
    }

    fn commit(
        &mut self,
        item: &WorkItem,
        batch: CommitBatch,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match item {
            WorkItem::Orchestrator(item) => self.commit_orchestrator(item, batch, now),
            WorkItem::Activity(item) => {
                let seq = self.activity_seq(item.id, &item.lease, now)?;
                self.activities.remove(&seq);
                self.push_downstream(batch, now);
                Ok(())
            }
            WorkItem::Timer(item) => {
                let seq = self.timer_seq(item.id, &item.lease, now)?;
                if let Some(timer) = self.timers.get_mut(&seq) {
                    timer.fired = true;
                    timer.lease = None;
                }
                self.push_downstream(batch, now);
                Ok(())
            }
        }
    }

    fn dead_letter(
        &mut self,
        item: &WorkItem,
        reason: &str,
        batch: CommitBatch,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut entries = Vec::new();
        let mut entry = |queue, instance_id: &str, payload| DeadLetterEntry {
            id: Uuid::now_v7(),
            queue,
            instance_id: instance_id.to_string(),
            payload,
            reason: reason.to_string(),
            dequeue_count: item.dequeue_count(),
            created_at: now,
        };

        match item {
            WorkItem::Orchestrator(orchestrator) => {
                self.check_instance_lock(&orchestrator.instance_id, &orchestrator.lease, now)?;
                for queued in self
                    .messages
                    .values()
                    .filter(|m| m.lock_token == Some(orchestrator.lease.token))
                {
                    let payload = serde_json::to_value(&queued.message)?;
                    entries.push(entry(QueueKind::Orchestrator, &orchestrator.instance_id, payload));
                }
                self.commit_orchestrator(orchestrator, batch, now)?;
            }
            WorkItem::Activity(activity) => {
                let seq = self.activity_seq(activity.id, &activity.lease, now)?;
                let payload = serde_json::to_value(&activity.request)?;
                entries.push(entry(QueueKind::Activity, &activity.request.instance_id, payload));
                self.activities.remove(&seq);
                self.push_downstream(batch, now);
            }
            WorkItem::Timer(timer) => {
                let seq = self.timer_seq(timer.id, &timer.lease, now)?;
                let payload = serde_json::to_value(&timer.request)?;
                entries.push(entry(QueueKind::Timer, &timer.request.instance_id, payload));
                self.timers.remove(&seq);
                self.push_downstream(batch, now);
            }
        }

        self.dead_letters.extend(entries);
        Ok(())
    }
}

/// In-memory implementation of TaskHubStore
///
/// This is primarily for testing. It stores all data in memory and
/// provides the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use taskhub_durable::clock::ManualClock;
/// use taskhub_durable::InMemoryTaskHubStore;
///
/// let clock = ManualClock::new();
/// let store = InMemoryTaskHubStore::with_clock(Arc::new(clock.clone()));
/// ```
pub struct InMemoryTaskHubStore {
    state: Mutex<HubState>,
    clock: Arc<dyn Clock>,
    fail_next_commit: AtomicBool,
}

impl InMemoryTaskHubStore {
    /// Create a new in-memory store on the wall clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a new in-memory store on the given clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            clock,
            fail_next_commit: AtomicBool::new(false),
        }
    }

    /// Make the next commit fail as if the process crashed before it was
    /// acknowledged; nothing from that commit becomes visible
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Get the number of instances
    pub fn instance_count(&self) -> usize {
        self.state.lock().instances.len()
    }

    /// Get the number of queued messages for an instance
    pub fn pending_message_count(&self, instance_id: &str) -> usize {
        self.state
            .lock()
            .messages
            .values()
            .filter(|m| m.message.instance_id == instance_id)
            .count()
    }

    /// Get the number of timers not yet fired
    pub fn pending_timer_count(&self) -> usize {
        self.state.lock().timers.values().filter(|t| !t.fired).count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.state.lock() = HubState::default();
    }

    /// Run `f` on a copy of the state and keep the copy only on success
    fn transact<T>(
        &self,
        f: impl FnOnce(&mut HubState, DateTime<Utc>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut staged = state.clone();
        let value = f(&mut staged, now)?;

        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Database(
                "simulated crash before commit was acknowledged".to_string(),
            ));
        }

        *state = staged;
        Ok(value)
    }
}

impl Default for InMemoryTaskHubStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHubStore for InMemoryTaskHubStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        Ok(())
    }

    #[instrument(skip(self, instance), fields(instance_id = %instance.instance_id))]
    async fn create_instance(&self, instance: NewInstance) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        if let Some(existing) = state.instances.get(&instance.instance_id) {
            if !existing.status.is_terminal() {
                return Err(StoreError::InstanceAlreadyExists(instance.instance_id));
            }
            state.remove_instance(&instance.instance_id);
        }

        state.insert_instance(&instance, now);
        state.push_message(instance.start_message(), now);
        debug!(name = %instance.name, "created instance");
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<InstanceState>, StoreError> {
        Ok(self.state.lock().instances.get(instance_id).cloned())
    }

    async fn read_history(&self, instance_id: &str) -> Result<Vec<RecordedEvent>, StoreError> {
        let state = self.state.lock();
        if !state.instances.contains_key(instance_id) {
            return Err(StoreError::InstanceNotFound(instance_id.to_string()));
        }
        Ok(state.current_history(instance_id))
    }

    #[instrument(skip(self))]
    async fn purge_instance(&self, instance_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let Some(instance) = state.instances.get(instance_id) else {
            return Ok(false);
        };
        if !instance.status.is_terminal() {
            return Err(StoreError::InstanceNotTerminal(instance_id.to_string()));
        }

        state.remove_instance(instance_id);
        debug!("purged instance");
        Ok(true)
    }

    async fn enqueue_orchestrator_message(
        &self,
        message: OrchestratorMessage,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.state.lock().push_message(message, now);
        Ok(())
    }

    async fn enqueue_activity_work(&self, request: ActivityRequest) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.state.lock().push_activity(request, now);
        Ok(())
    }

    async fn enqueue_timer(&self, request: TimerRequest) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.state.lock().push_timer(request, now);
        Ok(())
    }

    async fn lease_next(
        &self,
        queue: QueueKind,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<WorkItem>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let item = match queue {
            QueueKind::Orchestrator => state
                .lease_orchestrator(worker_id, lease_duration, now)
                .map(WorkItem::Orchestrator),
            QueueKind::Activity => state
                .lease_activity(worker_id, lease_duration, now)
                .map(WorkItem::Activity),
            QueueKind::Timer => state
                .lease_timer(worker_id, lease_duration, now)
                .map(WorkItem::Timer),
        };
        Ok(item)
    }

    #[instrument(skip(self, item, batch), fields(kind = %item.kind(), instance_id = %item.instance_id()))]
    async fn complete_and_commit(
        &self,
        item: &WorkItem,
        batch: CommitBatch,
    ) -> Result<(), StoreError> {
        self.transact(|state, now| state.commit(item, batch, now))
    }

    async fn abandon_work_item(
        &self,
        item: &WorkItem,
        delay: Option<Duration>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let visible_at = add_duration(now, delay.unwrap_or(Duration::ZERO));
        let mut state = self.state.lock();

        match item {
            WorkItem::Orchestrator(item) => {
                state.check_instance_lock(&item.instance_id, &item.lease, now)?;
                state.locks.remove(&item.instance_id);
                for queued in state
                    .messages
                    .values_mut()
                    .filter(|m| m.lock_token == Some(item.lease.token))
                {
                    queued.lock_token = None;
                    queued.visible_at = visible_at;
                }
            }
            WorkItem::Activity(item) => {
                let seq = state.activity_seq(item.id, &item.lease, now)?;
                if let Some(activity) = state.activities.get_mut(&seq) {
                    activity.lease = None;
                    activity.visible_at = visible_at;
                }
            }
            WorkItem::Timer(item) => {
                let seq = state.timer_seq(item.id, &item.lease, now)?;
                if let Some(timer) = state.timers.get_mut(&seq) {
                    timer.lease = None;
                    timer.visible_at = visible_at;
                }
            }
        }
        Ok(())
    }

    async fn renew_lease(
        &self,
        item: &WorkItem,
        extend_by: Duration,
    ) -> Result<Lease, StoreError> {
        let now = self.clock.now();
        let expires_at = add_duration(now, extend_by);
        let mut state = self.state.lock();

        let lease = match item {
            WorkItem::Orchestrator(item) => {
                state.check_instance_lock(&item.instance_id, &item.lease, now)?;
                let lock = state
                    .locks
                    .get_mut(&item.instance_id)
                    .ok_or(StoreError::LeaseLost)?;
                lock.expires_at = expires_at;
                lock.clone()
            }
            WorkItem::Activity(item) => {
                let seq = state.activity_seq(item.id, &item.lease, now)?;
                let lease = state
                    .activities
                    .get_mut(&seq)
                    .and_then(|a| a.lease.as_mut())
                    .ok_or(StoreError::LeaseLost)?;
                lease.expires_at = expires_at;
                lease.clone()
            }
            WorkItem::Timer(item) => {
                let seq = state.timer_seq(item.id, &item.lease, now)?;
                let lease = state
                    .timers
                    .get_mut(&seq)
                    .and_then(|t| t.lease.as_mut())
                    .ok_or(StoreError::LeaseLost)?;
                lease.expires_at = expires_at;
                lease.clone()
            }
        };
        Ok(lease)
    }

    #[instrument(skip(self, item, batch), fields(kind = %item.kind(), instance_id = %item.instance_id()))]
    async fn dead_letter(
        &self,
        item: &WorkItem,
        reason: &str,
        batch: CommitBatch,
    ) -> Result<(), StoreError> {
        self.transact(|state, now| state.dead_letter(item, reason, batch, now))
    }

    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .dead_letters
            .iter()
            .rev()
            .filter(|entry| filter.matches(entry))
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .cloned()
            .collect())
    }

    async fn queue_depths(&self) -> Result<QueueDepths, StoreError> {
        let state = self.state.lock();
        Ok(QueueDepths {
            orchestrator_messages: state.messages.len() as u64,
            activities: state.activities.len() as u64,
            timers: state.timers.values().filter(|t| !t.fired).count() as u64,
            dead_letters: state.dead_letters.len() as u64,
        })
    }
}
