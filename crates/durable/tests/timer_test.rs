//! Durable timer delivery tests

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskhub_durable::persistence::{NewInstance, QueueKind, TimerRequest, WorkItem};
use taskhub_durable::worker::TimerService;
use taskhub_durable::{Clock, HistoryEvent, InMemoryTaskHubStore, ManualClock, TaskHubConfig, TaskHubStore};

fn setup() -> (Arc<ManualClock>, Arc<InMemoryTaskHubStore>) {
    let clock = Arc::new(ManualClock::new());
    let store = Arc::new(InMemoryTaskHubStore::with_clock(clock.clone()));
    (clock, store)
}

async fn create_instance(store: &InMemoryTaskHubStore, id: &str) {
    store
        .create_instance(NewInstance {
            instance_id: id.to_string(),
            execution_id: format!("{}-exec", id),
            name: "greeting".to_string(),
            input: json!("5"),
            parent: None,
        })
        .await
        .unwrap();
}

fn timer(clock: &ManualClock, id: &str, timer_id: u64, after: Duration) -> TimerRequest {
    TimerRequest {
        instance_id: id.to_string(),
        execution_id: format!("{}-exec", id),
        timer_id,
        fire_at: clock.now() + chrono::Duration::from_std(after).unwrap(),
    }
}

/// TimerFired messages waiting for the instance
async fn fired_messages(store: &InMemoryTaskHubStore) -> Vec<u64> {
    let mut fired = Vec::new();
    if let Some(WorkItem::Orchestrator(item)) = store
        .lease_next(QueueKind::Orchestrator, "inspector", Duration::from_secs(30))
        .await
        .unwrap()
    {
        for message in &item.messages {
            if let HistoryEvent::TimerFired { id, .. } = message.event {
                fired.push(id);
            }
        }
    }
    fired
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sweeps_fire_each_timer_once() {
    let (clock, store) = setup();
    create_instance(&store, "timers").await;
    for timer_id in 0..10 {
        store
            .enqueue_timer(timer(&clock, "timers", timer_id, Duration::from_secs(5)))
            .await
            .unwrap();
    }
    clock.advance(Duration::from_secs(5));

    let handles = (0..4)
        .map(|n| {
            let service = TimerService::new(
                store.clone(),
                TaskHubConfig::default().with_worker_id(format!("sweeper-{}", n)),
            );
            tokio::spawn(async move { service.sweep().await.unwrap() })
        })
        .collect::<Vec<_>>();

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }

    assert_eq!(total, 10);
    let mut fired = fired_messages(&store).await;
    fired.sort_unstable();
    assert_eq!(fired, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_timer_not_fired_before_due() {
    let (clock, store) = setup();
    create_instance(&store, "early").await;
    let service = TimerService::new(store.clone(), TaskHubConfig::default());
    service
        .schedule_fire(timer(&clock, "early", 0, Duration::from_secs(60)))
        .await
        .unwrap();

    clock.advance(Duration::from_secs(59));
    assert_eq!(service.sweep().await.unwrap(), 0);

    clock.advance(Duration::from_secs(1));
    assert_eq!(service.sweep().await.unwrap(), 1);
    assert_eq!(service.sweep().await.unwrap(), 0);
}

#[tokio::test]
async fn test_scheduling_same_timer_twice_fires_once() {
    let (clock, store) = setup();
    create_instance(&store, "dup").await;
    let service = TimerService::new(store.clone(), TaskHubConfig::default());
    let request = timer(&clock, "dup", 3, Duration::from_secs(1));

    service.schedule_fire(request.clone()).await.unwrap();
    service.schedule_fire(request).await.unwrap();
    clock.advance(Duration::from_secs(1));

    assert_eq!(service.sweep().await.unwrap(), 1);
    assert_eq!(fired_messages(&store).await, vec![3]);
}

#[tokio::test]
async fn test_fired_timer_carries_scheduled_instant() {
    let (clock, store) = setup();
    create_instance(&store, "instant").await;
    let request = timer(&clock, "instant", 0, Duration::from_secs(10));
    let fire_at = request.fire_at;
    store.enqueue_timer(request).await.unwrap();

    // Sweeping late still reports the scheduled instant
    clock.advance(Duration::from_secs(25));
    TimerService::new(store.clone(), TaskHubConfig::default())
        .sweep()
        .await
        .unwrap();

    let item = match store
        .lease_next(QueueKind::Orchestrator, "inspector", Duration::from_secs(30))
        .await
        .unwrap()
    {
        Some(WorkItem::Orchestrator(item)) => item,
        other => panic!("expected orchestrator item, got {:?}", other),
    };
    let fired_at = item.messages.iter().find_map(|m| match m.event {
        HistoryEvent::TimerFired { fire_at, .. } => Some(fire_at),
        _ => None,
    });
    assert_eq!(fired_at, Some(fire_at));
    assert!(fire_at < clock.now());
}
