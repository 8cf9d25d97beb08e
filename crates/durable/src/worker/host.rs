//! Task hub worker
//!
//! Hosts the orchestration dispatcher, the activity dispatcher and the timer
//! service against one store. All three loops share a `watch` shutdown
//! channel.

use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::activity::ActivityDispatcher;
use super::orchestration::{DispatcherError, OrchestrationDispatcher};
use super::timer::TimerService;
use crate::activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
use crate::client::TaskHubClient;
use crate::clock::{Clock, SystemClock};
use crate::config::TaskHubConfig;
use crate::engine::OrchestrationRegistry;
use crate::orchestration::{OrchestrationContext, OrchestrationError, Orchestrator};
use crate::persistence::TaskHubStore;

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Loops are leasing work
    Running,
    /// Shutdown requested, finishing in-flight work
    Draining,
    /// Not started, or fully stopped
    Stopped,
}

struct RunningLoops {
    shutdown_tx: watch::Sender<bool>,
    orchestrations: Arc<OrchestrationDispatcher>,
    activities: Arc<ActivityDispatcher>,
    handles: Vec<JoinHandle<()>>,
}

/// Worker process for a task hub
///
/// # Example
///
/// ```ignore
/// let mut worker = TaskHubWorker::new(store, TaskHubConfig::from_env());
/// worker
///     .register_orchestration(GreetingOrchestration)
///     .register_activity(GetUser);
///
/// worker.start()?;
/// let id = worker.client().start_new_instance("greeting", None, json!("0")).await?;
/// // ...
/// worker.shutdown().await?;
/// ```
pub struct TaskHubWorker {
    store: Arc<dyn TaskHubStore>,
    config: TaskHubConfig,
    clock: Arc<dyn Clock>,
    orchestrations: OrchestrationRegistry,
    activities: ActivityRegistry,
    status: RwLock<WorkerStatus>,
    running: Mutex<Option<RunningLoops>>,
}

impl TaskHubWorker {
    pub fn new(store: Arc<dyn TaskHubStore>, config: TaskHubConfig) -> Self {
        Self {
            store,
            config,
            clock: Arc::new(SystemClock),
            orchestrations: OrchestrationRegistry::new(),
            activities: ActivityRegistry::new(),
            status: RwLock::new(WorkerStatus::Stopped),
            running: Mutex::new(None),
        }
    }

    /// Use `clock` for orchestration turn timestamps
    ///
    /// Pass the same clock the store uses.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn register_orchestration<O: Orchestrator>(&mut self, orchestrator: O) -> &mut Self {
        self.orchestrations.register(orchestrator);
        self
    }

    pub fn register_orchestration_fn<F, Fut>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(OrchestrationContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, OrchestrationError>> + Send + 'static,
    {
        self.orchestrations.register_fn(name, func);
        self
    }

    pub fn register_activity<A: Activity>(&mut self, activity: A) -> &mut Self {
        self.activities.register(activity);
        self
    }

    pub fn register_activity_fn<F, Fut>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        self.activities.register_fn(name, func);
        self
    }

    /// Client bound to this worker's store
    pub fn client(&self) -> TaskHubClient {
        TaskHubClient::new(Arc::clone(&self.store))
    }

    pub fn config(&self) -> &TaskHubConfig {
        &self.config
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    /// Spawn the dispatcher and timer loops
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), DispatcherError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(DispatcherError::AlreadyRunning);
        }

        info!(
            orchestrations = self.orchestrations.len(),
            activities = self.activities.len(),
            orchestration_concurrency = self.config.orchestration_concurrency,
            activity_concurrency = self.config.activity_concurrency,
            "Starting task hub worker"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let orchestrations = Arc::new(self.orchestration_dispatcher());
        let activities = Arc::new(self.activity_dispatcher());
        let timers = Arc::new(self.timer_service());

        let handles = vec![
            tokio::spawn(Arc::clone(&orchestrations).run(shutdown_rx.clone())),
            tokio::spawn(Arc::clone(&activities).run(shutdown_rx.clone())),
            tokio::spawn(timers.run(shutdown_rx)),
        ];

        *running = Some(RunningLoops {
            shutdown_tx,
            orchestrations,
            activities,
            handles,
        });
        *self.status.write() = WorkerStatus::Running;
        Ok(())
    }

    /// Stop leasing and wait for in-flight work
    ///
    /// Activities still running after the shutdown timeout are cancelled and
    /// released for redelivery.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), DispatcherError> {
        let Some(loops) = self.running.lock().take() else {
            return Ok(());
        };

        info!("Initiating graceful shutdown");
        *self.status.write() = WorkerStatus::Draining;
        let _ = loops.shutdown_tx.send(true);

        for handle in loops.handles {
            if let Err(e) = handle.await {
                warn!("Worker loop ended abnormally: {}", e);
            }
        }

        let timeout = self.config.shutdown_timeout;
        let orchestrations_drained =
            tokio::time::timeout(timeout, loops.orchestrations.drain()).await.is_ok();
        let activities_drained = loops.activities.drain(timeout).await;

        *self.status.write() = WorkerStatus::Stopped;

        if !orchestrations_drained {
            warn!("Orchestration turns still in flight at shutdown timeout");
            return Err(DispatcherError::ShutdownTimeout);
        }
        activities_drained?;

        info!("Task hub worker stopped");
        Ok(())
    }

    /// Process all available work inline until the hub is idle
    ///
    /// Sweeps due timers, then drains the orchestrator and activity queues,
    /// repeating until a round makes no progress. Returns the number of
    /// work items processed. Used to drive a hub deterministically, e.g.
    /// together with a `ManualClock`.
    pub async fn process_pending(&self) -> Result<usize, DispatcherError> {
        let orchestrations = self.orchestration_dispatcher();
        let activities = self.activity_dispatcher();
        let timers = self.timer_service();

        let mut total = 0;
        loop {
            let mut round = timers.sweep().await?;
            while orchestrations.process_next().await? {
                round += 1;
            }
            while activities.process_next().await? {
                round += 1;
            }

            if round == 0 {
                break;
            }
            total += round;
        }

        debug!(processed = total, "Processed pending work");
        Ok(total)
    }

    fn orchestration_dispatcher(&self) -> OrchestrationDispatcher {
        OrchestrationDispatcher::new(
            Arc::clone(&self.store),
            self.orchestrations.clone(),
            self.config.clone(),
        )
        .with_clock(Arc::clone(&self.clock))
    }

    fn activity_dispatcher(&self) -> ActivityDispatcher {
        ActivityDispatcher::new(
            Arc::clone(&self.store),
            self.activities.clone(),
            self.config.clone(),
        )
    }

    fn timer_service(&self) -> TimerService {
        TimerService::new(Arc::clone(&self.store), self.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::OrchestrationStatus;
    use crate::persistence::InMemoryTaskHubStore;
    use serde_json::json;
    use std::time::Duration;

    async fn double(ctx: OrchestrationContext, input: Value) -> Result<Value, OrchestrationError> {
        Ok(ctx.schedule_activity("double", input).await?)
    }

    async fn double_activity(_ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
        let n = input.as_i64().unwrap_or_default();
        Ok(json!(n * 2))
    }

    fn worker() -> TaskHubWorker {
        let store = Arc::new(InMemoryTaskHubStore::new());
        let config = TaskHubConfig::default()
            .with_poller(
                crate::worker::PollerConfig::new()
                    .with_min_interval(Duration::from_millis(5))
                    .with_max_interval(Duration::from_millis(20)),
            )
            .with_timer_sweep_interval(Duration::from_millis(10));
        let mut worker = TaskHubWorker::new(store, config);
        worker
            .register_orchestration_fn("double", double)
            .register_activity_fn("double", double_activity);
        worker
    }

    #[tokio::test]
    async fn test_process_pending_runs_to_completion() {
        let worker = worker();
        let client = worker.client();
        let id = client
            .start_new_instance("double", None, json!(21))
            .await
            .unwrap();

        let processed = worker.process_pending().await.unwrap();

        assert_eq!(processed, 3);
        let state = client.get_status(&id).await.unwrap().unwrap();
        assert_eq!(state.status, OrchestrationStatus::Completed);
        assert_eq!(state.output, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let worker = worker();
        let client = worker.client();

        worker.start().unwrap();
        assert_eq!(worker.status(), WorkerStatus::Running);
        assert!(matches!(worker.start(), Err(DispatcherError::AlreadyRunning)));

        let id = client
            .start_new_instance("double", None, json!(5))
            .await
            .unwrap();
        let state = client
            .wait_for_completion(&id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(state.output, Some(json!(10)));

        worker.shutdown().await.unwrap();
        assert_eq!(worker.status(), WorkerStatus::Stopped);
    }
}
