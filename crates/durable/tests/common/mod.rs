//! Shared fixtures for the task hub integration tests

#![allow(dead_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use taskhub_durable::{
    ActivityContext, ActivityError, InMemoryTaskHubStore, InstanceState, ManualClock,
    OrchestrationContext, OrchestrationError, TaskHubConfig, TaskHubWorker,
};

/// In-memory hub driven by a manual clock
pub struct Hub {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryTaskHubStore>,
    pub worker: TaskHubWorker,
}

impl Hub {
    pub fn new() -> Self {
        Self::with_config(TaskHubConfig::default().with_worker_id("test-worker"))
    }

    pub fn with_config(config: TaskHubConfig) -> Self {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(InMemoryTaskHubStore::with_clock(clock.clone()));
        let mut worker = TaskHubWorker::new(store.clone(), config).with_clock(clock.clone());
        register_all(&mut worker);
        Self {
            clock,
            store,
            worker,
        }
    }

    /// Start an instance with an explicit id
    pub async fn start(&self, orchestration: &str, instance_id: &str, input: Value) {
        self.worker
            .client()
            .start_new_instance(orchestration, Some(instance_id.to_string()), input)
            .await
            .unwrap();
    }

    /// Process work until the hub is idle
    pub async fn settle(&self) -> usize {
        self.worker.process_pending().await.unwrap()
    }

    /// Advance virtual time, then process work
    pub async fn advance(&self, by: Duration) -> usize {
        self.clock.advance(by);
        self.settle().await
    }

    pub async fn status(&self, instance_id: &str) -> InstanceState {
        self.worker
            .client()
            .get_status(instance_id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("instance {} not found", instance_id))
    }
}

pub fn register_all(worker: &mut TaskHubWorker) {
    worker
        .register_orchestration_fn("greeting", greeting)
        .register_orchestration_fn("fan_out", fan_out)
        .register_orchestration_fn("approval", approval)
        .register_orchestration_fn("parent", parent)
        .register_orchestration_fn("counter", counter)
        .register_orchestration_fn("race", race)
        .register_orchestration_fn("fragile", fragile)
        .register_orchestration_fn("adopter", adopter)
        .register_activity_fn("get_user", get_user)
        .register_activity_fn("send_greeting", send_greeting)
        .register_activity_fn("square", square)
        .register_activity_fn("sum", sum)
        .register_activity_fn("fail", fail);
}

// ============================================================================
// Orchestrations
// ============================================================================

/// get_user, optional delay in seconds from the input string, send_greeting
pub async fn greeting(ctx: OrchestrationContext, input: Value) -> Result<Value, OrchestrationError> {
    let user = ctx.schedule_activity("get_user", json!(null)).await?;

    let delay: u64 = input
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.trim().parse())
        .transpose()
        .map_err(|_| OrchestrationError::new("delay must be a number of seconds"))?
        .unwrap_or(0);
    if delay > 0 {
        ctx.create_timer_after(Duration::from_secs(delay)).await;
    }

    Ok(ctx.schedule_activity("send_greeting", user).await?)
}

/// Squares all inputs in parallel and sums the squares
pub async fn fan_out(ctx: OrchestrationContext, input: Value) -> Result<Value, OrchestrationError> {
    let numbers: Vec<i64> = serde_json::from_value(input)?;
    let tasks = numbers
        .iter()
        .map(|n| ctx.schedule_activity("square", json!(n)))
        .collect::<Vec<_>>();

    let squares = ctx.try_when_all(tasks).await?;
    ctx.set_custom_status(&squares)?;

    Ok(ctx.schedule_activity("sum", json!(squares)).await?)
}

/// Waits for an "approval" event, then greets the approver
pub async fn approval(ctx: OrchestrationContext, _input: Value) -> Result<Value, OrchestrationError> {
    let approver = ctx.wait_for_external_event("approval").await;
    Ok(ctx.schedule_activity("send_greeting", approver).await?)
}

/// Runs fan_out as a child and doubles its result
pub async fn parent(ctx: OrchestrationContext, input: Value) -> Result<Value, OrchestrationError> {
    let sum = ctx.create_sub_orchestration("fan_out", input).await?;
    let sum = sum.as_i64().unwrap_or_default();
    Ok(json!(sum * 2))
}

/// Counts up to 3 across executions
pub async fn counter(ctx: OrchestrationContext, input: Value) -> Result<Value, OrchestrationError> {
    let n: u64 = serde_json::from_value(input)?;
    if n >= 3 {
        return Ok(json!(n));
    }
    ctx.create_timer_after(Duration::from_secs(1)).await;
    ctx.continue_as_new(json!(n + 1)).await
}

type Branch = Pin<Box<dyn Future<Output = Value> + Send>>;

/// Approval event or a 60s timeout, whichever comes first
pub async fn race(ctx: OrchestrationContext, _input: Value) -> Result<Value, OrchestrationError> {
    let timeout = ctx.create_timer_after(Duration::from_secs(60));
    let event = ctx.wait_for_external_event("approval");

    let branches: Vec<Branch> = vec![
        Box::pin(async move {
            timeout.await;
            json!("timeout")
        }),
        Box::pin(event),
    ];
    let (_, winner) = ctx.when_any(branches).await;
    Ok(winner)
}

/// Calls an activity that always fails and reports the error it saw
pub async fn fragile(ctx: OrchestrationContext, _input: Value) -> Result<Value, OrchestrationError> {
    match ctx.schedule_activity("fail", json!("disk full")).await {
        Ok(_) => Ok(json!("unexpected success")),
        Err(e) => Ok(json!({
            "error_type": e.error_type(),
            "message": e.message(),
        })),
    }
}

/// Starts fan_out under the child id from the input and reports the outcome
pub async fn adopter(ctx: OrchestrationContext, input: Value) -> Result<Value, OrchestrationError> {
    let child = input["child"].as_str().unwrap_or_default().to_string();
    match ctx
        .create_sub_orchestration_with_id("fan_out", child, input["numbers"].clone())
        .await
    {
        Ok(sum) => Ok(json!({ "sum": sum })),
        Err(e) => Ok(json!({ "error_type": e.error_type() })),
    }
}

// ============================================================================
// Activities
// ============================================================================

pub async fn get_user(_ctx: ActivityContext, _input: Value) -> Result<Value, ActivityError> {
    Ok(json!("Gabbar"))
}

pub async fn send_greeting(_ctx: ActivityContext, user: Value) -> Result<Value, ActivityError> {
    let user = user.as_str().unwrap_or_default().to_string();
    Ok(json!(format!("Greeting send to {}", user)))
}

pub async fn square(_ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
    let n = input
        .as_i64()
        .ok_or_else(|| ActivityError::new("expected an integer"))?;
    Ok(json!(n * n))
}

pub async fn sum(_ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
    let values: Vec<i64> = serde_json::from_value(input)?;
    Ok(json!(values.iter().sum::<i64>()))
}

pub async fn fail(_ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
    Err(ActivityError::new(input.as_str().unwrap_or("failed")).with_type("DiskFull"))
}
