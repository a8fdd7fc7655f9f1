//! Redis 集成测试，需要本地 Redis：
//! `REDIS_URL=redis://127.0.0.1:6379/15 cargo test -p conveyor-infrastructure -- --ignored`

use std::collections::HashMap;
use std::time::Duration;

use conveyor_core::config::{DeadSetConfig, RedisConfig};
use conveyor_core::models::{generate_jid, Heartbeat, WorkEntry};
use conveyor_core::{QueueStore, SortedSet};
use conveyor_infrastructure::RedisStore;

async fn connect() -> RedisStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string());
    let config = RedisConfig {
        url: Some(url),
        // 每个测试独立命名空间，互不干扰
        namespace: Some(format!("conveyor-test-{}", generate_jid())),
        ..RedisConfig::default()
    };
    RedisStore::connect(&config).await.unwrap()
}

fn job(jid: &str, queue: &str) -> String {
    format!(r#"{{"jid":"{jid}","class":"Test","args":[],"queue":"{queue}","created_at":1.0}}"#)
}

#[tokio::test]
#[ignore]
async fn test_redis_reliable_fetch_cycle() {
    let store = connect().await;
    store.push("default", &[job("a", "default"), job("b", "default")]).await.unwrap();

    let first = store.pop_and_stage("default", "p1").await.unwrap().unwrap();
    assert!(first.contains(r#""jid":"a""#));
    assert_eq!(store.staging_lists().await.unwrap(), vec![("p1".to_string(), "default".to_string())]);

    assert!(store.requeue("p1", "default", &first).await.unwrap());
    let again = store.pop_and_stage("default", "p1").await.unwrap().unwrap();
    assert_eq!(again, first);
    assert!(store.acknowledge("p1", "default", &again).await.unwrap());

    let blocked = store
        .blocking_pop_and_stage("empty", "p1", Duration::from_millis(200))
        .await
        .unwrap();
    assert!(blocked.is_none());
}

#[tokio::test]
#[ignore]
async fn test_redis_retry_kill_and_promote() {
    let store = connect().await;
    let payload = job("r1", "mail");
    store.push("mail", &[payload.clone()]).await.unwrap();
    let staged = store.pop_and_stage("mail", "p1").await.unwrap().unwrap();

    assert!(store.retry("p1", "mail", &staged, &staged, 10.0).await.unwrap());
    assert!(!store.retry("p1", "mail", &staged, &staged, 10.0).await.unwrap());
    assert_eq!(store.zcard(SortedSet::Retry).await.unwrap(), 1);

    assert_eq!(store.promote_due(SortedSet::Retry, 20.0, 100).await.unwrap(), 1);
    assert_eq!(store.queue_size("mail").await.unwrap(), 1);

    let staged = store.pop_and_stage("mail", "p1").await.unwrap().unwrap();
    let limits = DeadSetConfig {
        max_jobs: 1,
        timeout_seconds: 1000,
    };
    assert!(store.kill("p1", "mail", &staged, &staged, 5000.0, &limits).await.unwrap());
    assert_eq!(store.zcard(SortedSet::Dead).await.unwrap(), 1);
}

#[tokio::test]
#[ignore]
async fn test_redis_heartbeat_and_signals() {
    let store = connect().await;
    let info = serde_json::json!({
        "identity": "p1", "hostname": "h", "pid": 1, "concurrency": 2,
        "queues": ["default"], "started_at": 1.0
    })
    .to_string();
    let mut work = HashMap::new();
    work.insert(
        "0".to_string(),
        WorkEntry {
            queue: "default".to_string(),
            payload: job("w", "default"),
            run_at: 1.0,
        },
    );
    store
        .heartbeat("p1", &info, &Heartbeat::now(1, true), &work, Duration::from_secs(60))
        .await
        .unwrap();

    let snapshot = store.process_snapshot("p1").await.unwrap().unwrap();
    assert!(snapshot.quiet);
    assert_eq!(snapshot.busy, 1);
    assert_eq!(store.work_entries("p1").await.unwrap().len(), 1);

    store.push_signal("p1", "TSTP").await.unwrap();
    store.push_signal("p1", "TERM").await.unwrap();
    assert_eq!(store.pop_signals("p1").await.unwrap(), vec!["TSTP", "TERM"]);

    store.deregister("p1").await.unwrap();
    assert!(!store.process_alive("p1").await.unwrap());
}
