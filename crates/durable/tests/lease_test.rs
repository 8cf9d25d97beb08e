//! Lease exclusivity and redelivery tests

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::Hub;
use serde_json::json;
use taskhub_durable::engine::OrchestrationRegistry;
use taskhub_durable::persistence::{
    ActivityRequest, CommitBatch, InstanceUpdate, NewInstance, OrchestratorMessage,
    OrchestratorWorkItem, QueueKind, WorkItem,
};
use taskhub_durable::worker::OrchestrationDispatcher;
use taskhub_durable::{
    HistoryEvent, InMemoryTaskHubStore, OrchestrationStatus, StoreError, TaskHubConfig,
    TaskHubStore,
};

const LEASE: Duration = Duration::from_secs(30);

fn new_instance(id: String) -> NewInstance {
    NewInstance {
        execution_id: format!("{}-exec", id),
        instance_id: id,
        name: "greeting".to_string(),
        input: json!("0"),
        parent: None,
    }
}

/// Lease from `workers` tasks until the queue is empty; returns leased instance ids
async fn lease_concurrently(
    store: Arc<InMemoryTaskHubStore>,
    queue: QueueKind,
    workers: usize,
) -> Vec<String> {
    let handles = (0..workers)
        .map(|n| {
            let store = store.clone();
            tokio::spawn(async move {
                let worker_id = format!("worker-{}", n);
                let mut leased = Vec::new();
                while let Some(item) = store.lease_next(queue, &worker_id, LEASE).await.unwrap() {
                    leased.push(match &item {
                        WorkItem::Activity(activity) => activity.id.to_string(),
                        other => other.instance_id().to_string(),
                    });
                    tokio::task::yield_now().await;
                }
                leased
            })
        })
        .collect::<Vec<_>>();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_instance_leases_are_exclusive_under_contention() {
    let store = Arc::new(InMemoryTaskHubStore::new());
    for n in 0..20 {
        store.create_instance(new_instance(format!("inst-{}", n))).await.unwrap();
    }

    let leased = lease_concurrently(store, QueueKind::Orchestrator, 8).await;

    let unique: HashSet<_> = leased.iter().collect();
    assert_eq!(leased.len(), 20);
    assert_eq!(unique.len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_activity_leases_are_exclusive_under_contention() {
    let store = Arc::new(InMemoryTaskHubStore::new());
    for task_id in 0..50 {
        store
            .enqueue_activity_work(ActivityRequest {
                instance_id: "fan".to_string(),
                execution_id: "fan-exec".to_string(),
                task_id,
                name: "square".to_string(),
                input: json!(task_id),
            })
            .await
            .unwrap();
    }

    let leased = lease_concurrently(store, QueueKind::Activity, 8).await;

    let unique: HashSet<_> = leased.iter().collect();
    assert_eq!(leased.len(), 50);
    assert_eq!(unique.len(), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_instance_has_one_owner() {
    let store = Arc::new(InMemoryTaskHubStore::new());
    store.create_instance(new_instance("hot".to_string())).await.unwrap();

    let leased = lease_concurrently(store, QueueKind::Orchestrator, 16).await;

    assert_eq!(leased, vec!["hot".to_string()]);
}

// ============================================
// Redelivery after a crashed worker
// ============================================

#[test_log::test(tokio::test)]
async fn test_orchestrator_item_redelivered_after_lease_expiry() {
    let hub = Hub::new();
    hub.start("fan_out", "crashed-orch", json!([3])).await;

    // A worker leases the instance and dies without committing
    let stale = hub
        .store
        .lease_next(QueueKind::Orchestrator, "crashed", LEASE)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(hub.settle().await, 0);
    assert_eq!(
        hub.status("crashed-orch").await.status,
        OrchestrationStatus::Pending
    );

    hub.advance(LEASE + Duration::from_secs(1)).await;
    let state = hub.status("crashed-orch").await;
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(state.output, Some(json!(9)));

    // The late commit of the crashed worker is fenced off
    let result = hub.store.complete_and_commit(&stale, CommitBatch::new()).await;
    assert_eq!(result, Err(StoreError::LeaseLost));
}

#[test_log::test(tokio::test)]
async fn test_activity_redelivered_after_lease_expiry() {
    let hub = Hub::new();
    hub.start("fan_out", "crashed-act", json!([3])).await;

    let mut registry = OrchestrationRegistry::new();
    registry.register_fn("fan_out", common::fan_out);
    let dispatcher = OrchestrationDispatcher::new(
        hub.store.clone(),
        registry,
        TaskHubConfig::default().with_worker_id("first-turn"),
    )
    .with_clock(hub.clock.clone());
    assert!(dispatcher.process_next().await.unwrap());

    let stale = match hub
        .store
        .lease_next(QueueKind::Activity, "crashed", LEASE)
        .await
        .unwrap()
    {
        Some(WorkItem::Activity(item)) => item,
        other => panic!("expected activity, got {:?}", other),
    };
    assert_eq!(stale.dequeue_count, 1);

    assert_eq!(hub.settle().await, 0);

    hub.advance(LEASE + Duration::from_secs(1)).await;
    let state = hub.status("crashed-act").await;
    assert_eq!(state.status, OrchestrationStatus::Completed);
    assert_eq!(state.output, Some(json!(9)));

    let result = hub
        .store
        .complete_and_commit(&WorkItem::Activity(stale), CommitBatch::new())
        .await;
    assert_eq!(result, Err(StoreError::LeaseLost));

    // Exactly one completion reached history
    let history = hub.worker.client().get_history("crashed-act").await.unwrap();
    let completions = history
        .iter()
        .filter(|e| matches!(e.event, HistoryEvent::TaskCompleted { id: 0, .. }))
        .count();
    assert_eq!(completions, 1);
}

#[test_log::test(tokio::test)]
async fn test_failed_commit_leaves_work_in_place() {
    let store = InMemoryTaskHubStore::new();
    store.create_instance(new_instance("atomic".to_string())).await.unwrap();
    let item = store
        .lease_next(QueueKind::Orchestrator, "worker", LEASE)
        .await
        .unwrap()
        .unwrap();

    store.fail_next_commit();
    let batch = CommitBatch::new().with_activity(ActivityRequest {
        instance_id: "atomic".to_string(),
        execution_id: "atomic-exec".to_string(),
        task_id: 0,
        name: "get_user".to_string(),
        input: json!(null),
    });
    assert!(store.complete_and_commit(&item, batch.clone()).await.is_err());

    let depths = store.queue_depths().await.unwrap();
    assert_eq!(depths.activities, 0);
    assert_eq!(depths.orchestrator_messages, 1);
    assert!(store.read_history("atomic").await.unwrap().is_empty());

    // Same lease, second attempt goes through
    store.complete_and_commit(&item, batch).await.unwrap();
    let depths = store.queue_depths().await.unwrap();
    assert_eq!(depths.activities, 1);
    assert_eq!(depths.orchestrator_messages, 0);
}

async fn lease_orchestrator(store: &InMemoryTaskHubStore, worker_id: &str) -> OrchestratorWorkItem {
    match store
        .lease_next(QueueKind::Orchestrator, worker_id, LEASE)
        .await
        .unwrap()
    {
        Some(WorkItem::Orchestrator(item)) => item,
        other => panic!("expected orchestrator item, got {:?}", other),
    }
}

#[test_log::test(tokio::test)]
async fn test_commit_with_stale_history_snapshot_is_rejected() {
    let store = InMemoryTaskHubStore::new();
    store.create_instance(new_instance("racy".to_string())).await.unwrap();

    // First turn records ExecutionStarted
    let first = lease_orchestrator(&store, "worker-1").await;
    assert_eq!(first.state.as_ref().unwrap().history_length, 0);
    store
        .complete_and_commit(
            &WorkItem::Orchestrator(first.clone()),
            CommitBatch::new()
                .with_history(first.messages.iter().map(|m| m.event.clone()).collect())
                .with_instance_update(InstanceUpdate::status(OrchestrationStatus::Running)),
        )
        .await
        .unwrap();

    store
        .enqueue_orchestrator_message(OrchestratorMessage::new(
            "racy",
            HistoryEvent::EventRaised {
                name: "approval".to_string(),
                input: json!(true),
            },
        ))
        .await
        .unwrap();
    let second = lease_orchestrator(&store, "worker-2").await;
    assert_eq!(second.state.as_ref().unwrap().history_length, 1);

    // A live lease paired with the state from before the first commit
    let stale = WorkItem::Orchestrator(OrchestratorWorkItem {
        state: first.state.clone(),
        history: first.history.clone(),
        ..second.clone()
    });
    let batch = CommitBatch::new()
        .with_history(vec![HistoryEvent::EventRaised {
            name: "approval".to_string(),
            input: json!(true),
        }])
        .with_activity(ActivityRequest {
            instance_id: "racy".to_string(),
            execution_id: "racy-exec".to_string(),
            task_id: 0,
            name: "get_user".to_string(),
            input: json!(null),
        });

    let result = store.complete_and_commit(&stale, batch.clone()).await;
    assert_eq!(
        result,
        Err(StoreError::ConcurrencyConflict {
            expected: 0,
            actual: 1
        })
    );

    assert_eq!(store.read_history("racy").await.unwrap().len(), 1);
    let depths = store.queue_depths().await.unwrap();
    assert_eq!(depths.activities, 0);
    assert_eq!(depths.orchestrator_messages, 1);
    assert_eq!(store.get_instance("racy").await.unwrap().unwrap().history_length, 1);

    // The up-to-date item still commits under the same lease
    store
        .complete_and_commit(&WorkItem::Orchestrator(second), batch)
        .await
        .unwrap();
    assert_eq!(store.read_history("racy").await.unwrap().len(), 2);
}
