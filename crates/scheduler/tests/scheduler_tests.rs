use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use conveyor_core::config::SchedulerConfig;
use conveyor_core::models::{now_epoch, Heartbeat, JobRecord};
use conveyor_core::{QueueStore, SortedSet};
use conveyor_infrastructure::InMemoryStore;
use conveyor_scheduler::{OrphanReaper, Poller};

fn payload(class: &str, queue: &str) -> String {
    JobRecord::new(class, vec![json!(1)])
        .with_queue(queue)
        .to_json()
        .unwrap()
}

fn poller(store: &Arc<InMemoryStore>, config: SchedulerConfig) -> Poller {
    Poller::new(store.clone(), config)
}

#[tokio::test]
async fn test_enqueue_due_moves_only_due_entries() {
    let store = Arc::new(InMemoryStore::new());
    let now = now_epoch();
    store.zadd(SortedSet::Schedule, now - 5.0, &payload("Due", "mail")).await.unwrap();
    store.zadd(SortedSet::Schedule, now + 600.0, &payload("Later", "mail")).await.unwrap();
    store.zadd(SortedSet::Retry, now - 1.0, &payload("Retry", "default")).await.unwrap();

    let promoted = poller(&store, SchedulerConfig::default()).enqueue_due(now).await.unwrap();

    assert_eq!(promoted, 2);
    assert_eq!(store.queue_size("mail").await.unwrap(), 1);
    assert_eq!(store.queue_size("default").await.unwrap(), 1);
    assert_eq!(store.zcard(SortedSet::Schedule).await.unwrap(), 1);
    assert_eq!(store.zcard(SortedSet::Retry).await.unwrap(), 0);
}

#[tokio::test]
async fn test_enqueue_due_drains_in_batches() {
    let store = Arc::new(InMemoryStore::new());
    let now = now_epoch();
    for i in 0..7 {
        store
            .zadd(SortedSet::Schedule, now - f64::from(i), &payload("Batch", "default"))
            .await
            .unwrap();
    }
    let config = SchedulerConfig {
        batch_size: 3,
        ..SchedulerConfig::default()
    };

    assert_eq!(poller(&store, config).enqueue_due(now).await.unwrap(), 7);
    assert_eq!(store.queue_size("default").await.unwrap(), 7);
}

#[tokio::test]
async fn test_promoted_payload_is_unchanged() {
    let store = Arc::new(InMemoryStore::new());
    let original = r#"{"jid":"abc","class":"Keep","args":[],"queue":"default","created_at":1.0,"custom":{"a":1}}"#;
    store.zadd(SortedSet::Retry, 1.0, original).await.unwrap();

    poller(&store, SchedulerConfig::default()).enqueue_due(2.0).await.unwrap();

    assert_eq!(store.queue_entries("default", 0, 0).await.unwrap(), vec![original.to_string()]);
}

#[tokio::test]
async fn test_store_failure_keeps_entries() {
    let store = Arc::new(InMemoryStore::new());
    store.zadd(SortedSet::Schedule, 1.0, &payload("Due", "default")).await.unwrap();
    store.inject_failure("promote_due");

    let poller = poller(&store, SchedulerConfig::default());
    assert!(poller.enqueue_due(2.0).await.is_err());
    assert_eq!(store.zcard(SortedSet::Schedule).await.unwrap(), 1);

    store.clear_failures();
    assert_eq!(poller.enqueue_due(2.0).await.unwrap(), 1);
}

#[tokio::test]
async fn test_average_interval_scales_with_processes() {
    let store = Arc::new(InMemoryStore::new());
    let config = SchedulerConfig {
        scaled_poll_interval: 5.0,
        ..SchedulerConfig::default()
    };
    let poller = poller(&store, config);

    // 注册表为空时按一个进程计算
    assert_eq!(poller.average_interval().await, 5.0);

    for identity in ["p1", "p2", "p3"] {
        store
            .heartbeat(identity, "{}", &Heartbeat::now(0, false), &Default::default(), Duration::from_secs(60))
            .await
            .unwrap();
    }
    assert_eq!(poller.average_interval().await, 15.0);

    let fixed = Poller::new(
        store.clone(),
        SchedulerConfig {
            poll_interval_average: Some(2.0),
            ..SchedulerConfig::default()
        },
    );
    assert_eq!(fixed.average_interval().await, 2.0);
}

#[tokio::test]
async fn test_initial_wait_bounds() {
    let store = Arc::new(InMemoryStore::new());
    let config = SchedulerConfig {
        initial_wait: 2.0,
        ..SchedulerConfig::default()
    };
    let poller = poller(&store, config);
    for _ in 0..50 {
        let wait = poller.initial_wait().as_secs_f64();
        assert!((2.0..4.0).contains(&wait), "wait {wait}");
    }
}

#[tokio::test]
async fn test_reaper_restores_dead_process_jobs_only() {
    let store = Arc::new(InMemoryStore::new());
    let ttl = Duration::from_secs(60);
    store.heartbeat("live", "{}", &Heartbeat::now(1, false), &Default::default(), ttl).await.unwrap();

    let orphan = payload("Orphan", "default");
    let running = payload("Running", "default");
    store.stage("crashed", "default", &orphan);
    store.stage("live", "default", &running);

    let reaper = OrphanReaper::new(store.clone(), Duration::from_secs(60));
    assert_eq!(reaper.reap_once().await.unwrap(), 1);

    assert!(store.staged("crashed", "default").is_empty());
    assert_eq!(store.staged("live", "default"), vec![running]);
    // 回收的任务放在队列前端，下一个被取出
    assert_eq!(store.pop_and_stage("default", "other").await.unwrap(), Some(orphan));

    assert_eq!(reaper.reap_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_reaper_after_process_expiry() {
    let store = Arc::new(InMemoryStore::new());
    store
        .heartbeat("p1", "{}", &Heartbeat::now(1, false), &Default::default(), Duration::from_secs(60))
        .await
        .unwrap();
    store.push("default", &[payload("Work", "default")]).await.unwrap();
    store.pop_and_stage("default", "p1").await.unwrap().unwrap();

    let reaper = OrphanReaper::new(store.clone(), Duration::from_secs(60));
    assert_eq!(reaper.reap_once().await.unwrap(), 0);

    store.expire_process("p1");
    assert_eq!(reaper.reap_once().await.unwrap(), 1);
    assert_eq!(store.queue_size("default").await.unwrap(), 1);
    assert_eq!(store.staged_total(), 0);
}

#[tokio::test]
async fn test_loops_stop_on_shutdown() {
    let store = Arc::new(InMemoryStore::new());
    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let poller = Arc::new(Poller::new(
        store.clone(),
        SchedulerConfig {
            initial_wait: 0.0,
            poll_interval_average: Some(0.05),
            ..SchedulerConfig::default()
        },
    ));
    let reaper = Arc::new(OrphanReaper::new(store.clone(), Duration::from_millis(50)));
    let poller_handle = poller.start(shutdown_tx.subscribe());
    let reaper_handle = reaper.start(shutdown_tx.subscribe());

    store.zadd(SortedSet::Schedule, 1.0, &payload("Due", "default")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.queue_size("default").await.unwrap(), 1);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), poller_handle).await.unwrap().unwrap();
    tokio::time::timeout(Duration::from_secs(1), reaper_handle).await.unwrap().unwrap();
}
