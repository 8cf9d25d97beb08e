// Sample orchestrations and activities
//
// - GreetingOrchestration: get_user, optional durable timer, send_greeting
// - FanOutOrchestration: squares every input in parallel, then sums them

use std::time::Duration;

use async_trait::async_trait;
use taskhub_durable::{
    Activity, ActivityContext, ActivityError, OrchestrationContext, OrchestrationError,
    Orchestrator, TaskHubWorker,
};
use tracing::info;

// ============================================================================
// Greeting
// ============================================================================

/// Greets the user returned by `get_user`, after an optional delay
///
/// The input is the delay in seconds as a string; empty means no delay.
pub struct GreetingOrchestration;

#[async_trait]
impl Orchestrator for GreetingOrchestration {
    const NAME: &'static str = "greeting";
    type Input = String;
    type Output = String;

    async fn run(
        &self,
        ctx: OrchestrationContext,
        input: Self::Input,
    ) -> Result<Self::Output, OrchestrationError> {
        let user: String = ctx
            .schedule_activity_typed(GetUser::NAME, &())?
            .await?;

        let delay_secs = parse_delay(&input)?;
        if delay_secs > 0 {
            ctx.create_timer_after(Duration::from_secs(delay_secs)).await;
        }

        let greeting: String = ctx
            .schedule_activity_typed(SendGreeting::NAME, &user)?
            .await?;
        Ok(greeting)
    }
}

fn parse_delay(input: &str) -> Result<u64, OrchestrationError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(0);
    }
    input
        .parse()
        .map_err(|_| OrchestrationError::new(format!("invalid delay: {:?}", input)))
}

pub struct GetUser;

#[async_trait]
impl Activity for GetUser {
    const NAME: &'static str = "get_user";
    type Input = ();
    type Output = String;

    async fn execute(&self, _ctx: &ActivityContext, _input: ()) -> Result<String, ActivityError> {
        Ok("Gabbar".to_string())
    }
}

pub struct SendGreeting;

#[async_trait]
impl Activity for SendGreeting {
    const NAME: &'static str = "send_greeting";
    type Input = String;
    type Output = String;

    async fn execute(&self, ctx: &ActivityContext, user: String) -> Result<String, ActivityError> {
        info!(instance_id = %ctx.instance_id, %user, "Sending greeting");
        Ok(format!("Greeting send to {}", user))
    }
}

// ============================================================================
// Fan-out / fan-in
// ============================================================================

/// Squares every input concurrently and returns the sum of the squares
pub struct FanOutOrchestration;

#[async_trait]
impl Orchestrator for FanOutOrchestration {
    const NAME: &'static str = "fan_out";
    type Input = Vec<i64>;
    type Output = i64;

    async fn run(
        &self,
        ctx: OrchestrationContext,
        input: Self::Input,
    ) -> Result<Self::Output, OrchestrationError> {
        let tasks = input
            .iter()
            .map(|n| ctx.schedule_activity_typed::<_, i64>(Square::NAME, n))
            .collect::<Result<Vec<_>, _>>()?;

        let squares = ctx.try_when_all(tasks).await?;
        ctx.set_custom_status(&squares)?;

        let sum: i64 = ctx.schedule_activity_typed(Sum::NAME, &squares)?.await?;
        Ok(sum)
    }
}

pub struct Square;

#[async_trait]
impl Activity for Square {
    const NAME: &'static str = "square";
    type Input = i64;
    type Output = i64;

    async fn execute(&self, _ctx: &ActivityContext, n: i64) -> Result<i64, ActivityError> {
        n.checked_mul(n)
            .ok_or_else(|| ActivityError::new(format!("{} squared overflows", n)))
    }
}

pub struct Sum;

#[async_trait]
impl Activity for Sum {
    const NAME: &'static str = "sum";
    type Input = Vec<i64>;
    type Output = i64;

    async fn execute(&self, _ctx: &ActivityContext, values: Vec<i64>) -> Result<i64, ActivityError> {
        Ok(values.iter().sum())
    }
}

/// Register every sample orchestration and activity
pub fn register_samples(worker: &mut TaskHubWorker) {
    worker
        .register_orchestration(GreetingOrchestration)
        .register_orchestration(FanOutOrchestration)
        .register_activity(GetUser)
        .register_activity(SendGreeting)
        .register_activity(Square)
        .register_activity(Sum);
}
