use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use conveyor_core::models::{now_epoch, JobRecord, ProcessSignal, RetryPolicy};
use conveyor_core::{Client, Inspector, JobLocation, JobRequest, QueueStore, SortedSet};
use conveyor_infrastructure::InMemoryStore;

fn setup() -> (Arc<InMemoryStore>, Client, Inspector) {
    let store = Arc::new(InMemoryStore::new());
    let client = Client::new(store.clone());
    let inspector = Inspector::new(store.clone());
    (store, client, inspector)
}

#[tokio::test]
async fn test_push_writes_wire_format() {
    let (store, client, _) = setup();
    let jid = client
        .push(
            JobRequest::new("HardWorker", vec![json!("bob"), json!(5)])
                .queue("critical")
                .retry(RetryPolicy::Limit(3)),
        )
        .await
        .unwrap();

    let entries = store.queue_entries("critical", 0, 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    let job = JobRecord::from_json(&entries[0]).unwrap();
    assert_eq!(job.id, jid);
    assert_eq!(job.class, "HardWorker");
    assert_eq!(job.args, vec![json!("bob"), json!(5)]);
    assert_eq!(job.retry, RetryPolicy::Limit(3));
    assert!(job.enqueued_at.is_some());
    assert!(store.queue_names().await.unwrap().contains(&"critical".to_string()));
}

#[tokio::test]
async fn test_push_defaults_queue_and_rejects_invalid() {
    let (store, client, _) = setup();
    client.push(JobRequest::new("Noop", vec![])).await.unwrap();
    assert_eq!(store.queue_size("default").await.unwrap(), 1);

    assert!(client.push(JobRequest::new("", vec![])).await.is_err());
    assert!(client
        .push(JobRequest::new("Noop", vec![]).queue("bad:name"))
        .await
        .is_err());
}

#[tokio::test]
async fn test_future_jobs_go_to_schedule_set() {
    let (store, client, _) = setup();
    client
        .schedule_in(JobRequest::new("Later", vec![]), Duration::from_secs(3600))
        .await
        .unwrap();
    client
        .schedule_at(JobRequest::new("Past", vec![]), now_epoch() - 10.0)
        .await
        .unwrap();

    assert_eq!(store.zcard(SortedSet::Schedule).await.unwrap(), 1);
    assert_eq!(store.queue_size("default").await.unwrap(), 1);

    let (payload, score) = store.zrange(SortedSet::Schedule, 0, 0).await.unwrap().remove(0);
    let job = JobRecord::from_json(&payload).unwrap();
    assert_eq!(job.class, "Later");
    assert!(job.enqueued_at.is_none());
    assert!(score > now_epoch() + 3000.0);
}

#[tokio::test]
async fn test_push_bulk_returns_jids_in_order() {
    let (store, client, _) = setup();
    let jids = client
        .push_bulk(vec![
            JobRequest::new("A", vec![json!(1)]),
            JobRequest::new("B", vec![json!(2)]).queue("other"),
            JobRequest::new("C", vec![json!(3)]),
        ])
        .await
        .unwrap();
    assert_eq!(jids.len(), 3);
    assert_eq!(store.queue_size("default").await.unwrap(), 2);
    assert_eq!(store.queue_size("other").await.unwrap(), 1);

    // 同一批次内按提交顺序出队
    let first = store.pop_and_stage("default", "p").await.unwrap().unwrap();
    assert_eq!(JobRecord::from_json(&first).unwrap().id, jids[0]);
}

#[tokio::test]
async fn test_inspector_lists_and_deletes_by_jid() {
    let (_, client, inspector) = setup();
    let keep = client.push(JobRequest::new("Keep", vec![])).await.unwrap();
    let drop = client.push(JobRequest::new("Drop", vec![])).await.unwrap();

    let queues = inspector.queues().await.unwrap();
    assert_eq!(queues.len(), 1);
    assert_eq!(queues[0].size, 2);

    let page = inspector.queue_jobs("default", 1, 10).await.unwrap();
    assert_eq!(page[0].jid.as_deref(), Some(drop.as_str()));

    let location = JobLocation::Queue("default".to_string());
    assert!(inspector.delete_job(&location, &drop).await.unwrap());
    assert!(!inspector.delete_job(&location, &drop).await.unwrap());
    assert!(inspector.find_job(&location, &keep).await.unwrap().is_some());
}

#[tokio::test]
async fn test_retry_now_moves_set_entry_to_queue() {
    let (store, client, inspector) = setup();
    let jid = client
        .schedule_in(
            JobRequest::new("Later", vec![]).queue("mail"),
            Duration::from_secs(600),
        )
        .await
        .unwrap();

    assert!(inspector.retry_now(SortedSet::Schedule, &jid).await.unwrap());
    assert_eq!(store.zcard(SortedSet::Schedule).await.unwrap(), 0);
    assert_eq!(store.queue_size("mail").await.unwrap(), 1);

    assert!(inspector.retry_now(SortedSet::Schedule, &jid).await.is_err());
}

#[tokio::test]
async fn test_clear_queue_and_overview() {
    let (store, client, inspector) = setup();
    for _ in 0..3 {
        client.push(JobRequest::new("Noop", vec![])).await.unwrap();
    }
    store.incr_stats(7, 2, chrono::Utc::now()).await.unwrap();

    let overview = inspector.overview().await.unwrap();
    assert_eq!(overview.enqueued, 3);
    assert_eq!(overview.processed, 7);
    assert_eq!(overview.failed, 2);

    assert_eq!(inspector.clear_queue("default").await.unwrap(), 3);
    assert!(inspector.queues().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_signal_only_live_processes() {
    let (store, _, inspector) = setup();
    assert!(!inspector.quiet_process("ghost").await.unwrap());

    let info = json!({
        "identity": "p1", "hostname": "h", "pid": 1, "concurrency": 1,
        "queues": ["default"], "started_at": 1.0
    })
    .to_string();
    store
        .heartbeat(
            "p1",
            &info,
            &conveyor_core::models::Heartbeat::now(0, false),
            &Default::default(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

    assert!(inspector.stop_process("p1").await.unwrap());
    assert_eq!(
        store.pop_signals("p1").await.unwrap(),
        vec![ProcessSignal::Stop.as_str().to_string()]
    );
    assert_eq!(inspector.processes().await.unwrap().len(), 1);
}
