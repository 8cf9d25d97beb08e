//! End-to-end orchestration tests on the in-memory task hub
//!
//! Every test drives the hub deterministically with `process_pending` and a
//! manual clock; no background loops run.

mod common;

use std::time::Duration;

use common::Hub;
use serde_json::json;
use taskhub_durable::history::error_types;
use taskhub_durable::persistence::QueueKind;
use taskhub_durable::{ClientError, HistoryEvent, OrchestrationStatus, TaskHubConfig};

// ============================================
// Greeting
// ============================================

#[test_log::test(tokio::test)]
async fn test_greeting_without_delay_completes_immediately() {
    let hub = Hub::new();
    hub.start("greeting", "greet-0", json!("0")).await;

    hub.settle().await;

    let state = hub.status("greet-0").await;
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(state.output, Some(json!("Greeting send to Gabbar")));
}

#[test_log::test(tokio::test)]
async fn test_greeting_waits_for_timer() {
    let hub = Hub::new();
    hub.start("greeting", "greet-5", json!("5")).await;

    hub.settle().await;
    assert_eq!(hub.status("greet-5").await.status, OrchestrationStatus::Running);

    hub.advance(Duration::from_secs(4)).await;
    assert_eq!(hub.status("greet-5").await.status, OrchestrationStatus::Running);

    hub.advance(Duration::from_secs(1)).await;
    let state = hub.status("greet-5").await;
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(state.output, Some(json!("Greeting send to Gabbar")));

    let history = hub.worker.client().get_history("greet-5").await.unwrap();
    let fired = history
        .iter()
        .filter(|e| matches!(e.event, HistoryEvent::TimerFired { .. }))
        .count();
    assert_eq!(fired, 1);
}

#[test_log::test(tokio::test)]
async fn test_invalid_input_fails_orchestration() {
    let hub = Hub::new();
    hub.start("greeting", "greet-bad", json!("soon")).await;

    hub.settle().await;

    let state = hub.status("greet-bad").await;
    assert_eq!(state.status, OrchestrationStatus::Failed);
    assert_eq!(
        state.failure.unwrap().message,
        "delay must be a number of seconds"
    );
}

// ============================================
// Fan-out / fan-in
// ============================================

#[test_log::test(tokio::test)]
async fn test_fan_out_sums_squares() {
    let hub = Hub::new();
    hub.start("fan_out", "fan-1", json!([1, 2, 3])).await;

    hub.settle().await;

    let state = hub.status("fan-1").await;
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(state.output, Some(json!(14)));
    assert_eq!(state.custom_status, Some(json!([1, 4, 9])));
}

#[test_log::test(tokio::test)]
async fn test_fan_out_schedules_all_activities_in_one_turn() {
    let hub = Hub::new();
    hub.start("fan_out", "fan-2", json!([1, 2, 3])).await;

    hub.settle().await;

    let history = hub.worker.client().get_history("fan-2").await.unwrap();
    let first_completion = history
        .iter()
        .position(|e| matches!(e.event, HistoryEvent::TaskCompleted { .. }))
        .unwrap();
    let scheduled: Vec<u64> = history[..first_completion]
        .iter()
        .filter_map(|e| match &e.event {
            HistoryEvent::TaskScheduled { id, name, .. } if name == "square" => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(scheduled, vec![0, 1, 2]);
}

// ============================================
// External events
// ============================================

#[test_log::test(tokio::test)]
async fn test_external_event_resumes_orchestration() {
    let hub = Hub::new();
    let client = hub.worker.client();
    hub.start("approval", "appr-1", json!(null)).await;

    hub.settle().await;
    assert_eq!(hub.status("appr-1").await.status, OrchestrationStatus::Running);

    client
        .raise_event("appr-1", "approval", json!("Basanti"))
        .await
        .unwrap();
    hub.settle().await;

    let state = hub.status("appr-1").await;
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(state.output, Some(json!("Greeting send to Basanti")));
}

#[test_log::test(tokio::test)]
async fn test_event_raised_before_wait_is_buffered() {
    let hub = Hub::new();
    let client = hub.worker.client();
    hub.start("approval", "appr-2", json!(null)).await;

    // Delivered together with ExecutionStarted
    client
        .raise_event("appr-2", "approval", json!("Jai"))
        .await
        .unwrap();
    hub.settle().await;

    assert_eq!(
        hub.status("appr-2").await.output,
        Some(json!("Greeting send to Jai"))
    );
}

#[test_log::test(tokio::test)]
async fn test_when_any_picks_first_completion() {
    let hub = Hub::new();
    let client = hub.worker.client();
    hub.start("race", "race-event", json!(null)).await;
    hub.start("race", "race-timeout", json!(null)).await;
    hub.settle().await;

    client
        .raise_event("race-event", "approval", json!("approved"))
        .await
        .unwrap();
    hub.settle().await;
    assert_eq!(hub.status("race-event").await.output, Some(json!("approved")));

    hub.advance(Duration::from_secs(60)).await;
    assert_eq!(hub.status("race-timeout").await.output, Some(json!("timeout")));
    // The late timer of the finished race is discarded
    assert_eq!(hub.status("race-event").await.output, Some(json!("approved")));
}

// ============================================
// Terminate and purge
// ============================================

#[test_log::test(tokio::test)]
async fn test_terminate_running_instance() {
    let hub = Hub::new();
    let client = hub.worker.client();
    hub.start("approval", "term-1", json!(null)).await;
    hub.settle().await;

    client.terminate("term-1", "no longer needed").await.unwrap();
    hub.settle().await;

    let state = hub.status("term-1").await;
    assert_eq!(state.status, OrchestrationStatus::Terminated);
    assert_eq!(state.output, Some(json!("no longer needed")));

    // Terminal instances accept no more events
    let err = client
        .raise_event("term-1", "approval", json!("late"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InstanceNotRunning(_)));
}

#[test_log::test(tokio::test)]
async fn test_purge_removes_terminal_instance() {
    let hub = Hub::new();
    let client = hub.worker.client();
    hub.start("greeting", "purge-1", json!("0")).await;
    hub.settle().await;

    assert!(client.purge_instance("purge-1").await.unwrap());

    assert!(client.get_status("purge-1").await.unwrap().is_none());
    assert!(!client.purge_instance("purge-1").await.unwrap());
}

#[test_log::test(tokio::test)]
async fn test_restart_replaces_terminal_instance() {
    let hub = Hub::new();
    hub.start("greeting", "again", json!("0")).await;
    hub.settle().await;

    hub.start("fan_out", "again", json!([2])).await;
    hub.settle().await;

    let state = hub.status("again").await;
    assert_eq!(state.name, "fan_out");
    assert_eq!(state.output, Some(json!(4)));
}

// ============================================
// Sub-orchestrations and ContinueAsNew
// ============================================

#[test_log::test(tokio::test)]
async fn test_sub_orchestration_with_explicit_id() {
    let hub = Hub::new();
    hub.start("adopter", "adopter-1", json!({"child": "fresh", "numbers": [2]}))
        .await;

    hub.settle().await;

    assert_eq!(hub.status("adopter-1").await.output, Some(json!({"sum": 4})));
    assert_eq!(hub.status("fresh").await.parent.unwrap().instance_id, "adopter-1");
}

#[test_log::test(tokio::test)]
async fn test_sub_orchestration_on_existing_id_fails_parent_task() {
    let hub = Hub::new();
    hub.start("fan_out", "finished", json!([1])).await;
    hub.start("approval", "waiting", json!(null)).await;
    hub.settle().await;
    let finished = hub.status("finished").await;
    let waiting = hub.status("waiting").await;

    hub.start("adopter", "adopt-finished", json!({"child": "finished", "numbers": [5]}))
        .await;
    hub.start("adopter", "adopt-waiting", json!({"child": "waiting", "numbers": [5]}))
        .await;
    hub.settle().await;

    for parent in ["adopt-finished", "adopt-waiting"] {
        let state = hub.status(parent).await;
        assert_eq!(state.status, OrchestrationStatus::Completed);
        assert_eq!(
            state.output,
            Some(json!({"error_type": "InstanceAlreadyExists"}))
        );
    }

    // The existing instances are left alone
    let after = hub.status("finished").await;
    assert_eq!(after.output, Some(json!(1)));
    assert_eq!(after.execution_id, finished.execution_id);
    assert_eq!(after.history_length, finished.history_length);
    let after = hub.status("waiting").await;
    assert_eq!(after.status, OrchestrationStatus::Running);
    assert_eq!(after.history_length, waiting.history_length);
}

#[test_log::test(tokio::test)]
async fn test_sub_orchestration_result_flows_to_parent() {
    let hub = Hub::new();
    hub.start("parent", "parent-1", json!([1, 2, 3])).await;

    hub.settle().await;

    let state = hub.status("parent-1").await;
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(state.output, Some(json!(28)));

    let history = hub.worker.client().get_history("parent-1").await.unwrap();
    let child_id = history
        .iter()
        .find_map(|e| match &e.event {
            HistoryEvent::SubOrchestrationCreated { instance_id, .. } => Some(instance_id.clone()),
            _ => None,
        })
        .unwrap();
    let child = hub.status(&child_id).await;
    assert_eq!(child.status, OrchestrationStatus::Completed);
    assert_eq!(child.parent.unwrap().instance_id, "parent-1");
}

#[test_log::test(tokio::test)]
async fn test_continue_as_new_restarts_with_fresh_history() {
    let hub = Hub::new();
    hub.start("counter", "count-1", json!(0)).await;
    hub.settle().await;
    let first_execution = hub.status("count-1").await.execution_id;

    for _ in 0..3 {
        hub.advance(Duration::from_secs(1)).await;
    }

    let state = hub.status("count-1").await;
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(state.output, Some(json!(3)));
    assert_eq!(state.input, json!(3));
    assert_ne!(state.execution_id, first_execution);

    // History of the final execution only
    let history = hub.worker.client().get_history("count-1").await.unwrap();
    assert!(matches!(
        history[0].event,
        HistoryEvent::ExecutionStarted { ref input, .. } if *input == json!(3)
    ));
    assert!(!history
        .iter()
        .any(|e| matches!(e.event, HistoryEvent::TimerCreated { .. })));
}

// ============================================
// Failures
// ============================================

#[test_log::test(tokio::test)]
async fn test_activity_failure_surfaces_as_task_error() {
    let hub = Hub::new();
    hub.start("fragile", "fragile-1", json!(null)).await;

    hub.settle().await;

    let state = hub.status("fragile-1").await;
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(
        state.output,
        Some(json!({"error_type": "DiskFull", "message": "disk full"}))
    );
}

#[test_log::test(tokio::test)]
async fn test_unknown_orchestration_is_retried_then_dead_lettered() {
    let config = TaskHubConfig::default()
        .with_max_dequeue_count(2)
        .with_unknown_orchestration_delay(Duration::from_secs(5));
    let hub = Hub::with_config(config);
    hub.start("does_not_exist", "unknown-1", json!(null)).await;

    hub.settle().await;
    assert_eq!(hub.status("unknown-1").await.status, OrchestrationStatus::Pending);

    hub.advance(Duration::from_secs(5)).await;
    hub.advance(Duration::from_secs(5)).await;

    let state = hub.status("unknown-1").await;
    assert_eq!(state.status, OrchestrationStatus::Failed);
    assert!(state.failure.unwrap().is(error_types::POISON_MESSAGE));

    let dead = hub
        .worker
        .client()
        .dead_letters(Default::default(), Default::default())
        .await
        .unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].queue, QueueKind::Orchestrator);
    assert_eq!(dead[0].instance_id, "unknown-1");
}

#[test_log::test(tokio::test)]
async fn test_crash_before_commit_is_retried() {
    let hub = Hub::new();
    hub.start("greeting", "crash-1", json!("0")).await;

    // The first commit attempt is lost; the dispatcher retries it
    hub.store.fail_next_commit();
    hub.settle().await;

    let state = hub.status("crash-1").await;
    assert_eq!(state.status, OrchestrationStatus::Completed);

    let history = hub.worker.client().get_history("crash-1").await.unwrap();
    let started = history
        .iter()
        .filter(|e| matches!(e.event, HistoryEvent::ExecutionStarted { .. }))
        .count();
    assert_eq!(started, 1);
}
