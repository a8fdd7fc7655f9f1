use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use conveyor_core::config::{DeadSetConfig, QueueWeight, RetryConfig, WorkerConfig};
use conveyor_core::models::{now_epoch, BacktraceOption, JobRecord, RetryPolicy};
use conveyor_core::{Client, HandlerRegistry, JobError, JobHandler, JobRequest, QueueStore, SortedSet};
use conveyor_infrastructure::InMemoryStore;
use conveyor_worker::{
    Chain, Fetcher, JobContext, JobResult, Next, Processor, ProcessorState, ProcessStats,
    QueueOrder, RetryMiddleware, ServerMiddleware,
};

const IDENTITY: &str = "test-host:1:abcdef012345";

struct PanicHandler;

#[async_trait]
impl JobHandler for PanicHandler {
    async fn perform(&self, _args: &[Value]) -> anyhow::Result<()> {
        panic!("kaboom");
    }
}

/// 吞掉所有失败的用户中间件
struct Swallow;

#[async_trait]
impl ServerMiddleware for Swallow {
    async fn call(&self, ctx: &mut JobContext, next: Next<'_>) -> JobResult {
        let _ = next.run(ctx).await;
        Ok(())
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    client: Client,
    processor: Arc<Processor>,
    stats: Arc<ProcessStats>,
    counter: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

fn registry(counter: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> HandlerRegistry {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry
        .register_fn("Tracked", move |_| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        })
        .register_fn("Count", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        })
        .register_fn("Fail", |_| async { Err::<(), _>(anyhow::anyhow!("boom")) })
        .register_fn("Typed", |_| async {
            Err::<(), anyhow::Error>(JobError::new("PaymentDeclined", "card declined").into())
        })
        .register_fn("Slow", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<(), anyhow::Error>(())
        })
        .register("Panic", Arc::new(PanicHandler));
    registry
}

fn harness_with(middleware: Vec<Arc<dyn ServerMiddleware>>, concurrency: usize) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let config = WorkerConfig {
        concurrency,
        fetch_timeout_ms: 50,
        idle_delay_ms: 10,
        ..WorkerConfig::default()
    };
    let retry = Arc::new(RetryMiddleware::new(
        store.clone(),
        RetryConfig::default(),
        DeadSetConfig::default(),
    ));
    let chain = Chain::new(middleware, retry, Arc::new(registry(counter.clone(), peak.clone())));
    let order = QueueOrder::new(vec![QueueWeight::parse("default").unwrap()], true);
    let fetcher = Fetcher::new(store.clone(), IDENTITY, order, config.fetch_timeout());
    let stats = Arc::new(ProcessStats::new());
    let processor = Arc::new(Processor::new(
        store.clone(),
        fetcher,
        chain,
        &config,
        DeadSetConfig::default(),
        stats.clone(),
    ));
    Harness {
        client: Client::new(store.clone()),
        store,
        processor,
        stats,
        counter,
        peak,
    }
}

fn harness() -> Harness {
    harness_with(Vec::new(), 2)
}

async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn retry_entries(store: &InMemoryStore) -> Vec<(JobRecord, f64)> {
    store
        .zrange(SortedSet::Retry, 0, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|(payload, score)| (JobRecord::from_json(&payload).unwrap(), score))
        .collect()
}

#[tokio::test]
async fn test_successful_job_is_acknowledged() {
    let h = &harness();
    h.client.push(JobRequest::new("Count", vec![json!(1)])).await.unwrap();
    h.processor.start().await.unwrap();

    eventually(move || async move { h.counter.load(Ordering::SeqCst) == 1 && h.store.staged_total() == 0 }).await;
    h.processor.terminate(Duration::from_secs(1)).await;

    assert_eq!(h.store.queue_size("default").await.unwrap(), 0);
    assert_eq!(h.stats.take(), (1, 0));
    assert_eq!(h.processor.state(), ProcessorState::Terminated);
}

#[tokio::test]
async fn test_failure_moves_job_to_retry_set() {
    let h = &harness();
    let before = now_epoch();
    let jid = h.client.push(JobRequest::new("Fail", vec![])).await.unwrap();
    h.processor.start().await.unwrap();

    eventually(move || async move { h.store.zcard(SortedSet::Retry).await.unwrap() == 1 }).await;
    h.processor.terminate(Duration::from_secs(1)).await;

    let (job, score) = retry_entries(&h.store).await.remove(0);
    assert_eq!(job.id, jid);
    assert_eq!(job.retry_count, Some(1));
    assert_eq!(job.error_class.as_deref(), Some("JobError"));
    assert_eq!(job.error_message.as_deref(), Some("boom"));
    assert!(job.failed_at.is_some());
    assert!(job.retried_at.is_none());
    // 第一次重试延迟在 [16, 30] 秒之间
    assert!(score >= before + 16.0 && score <= now_epoch() + 30.0, "score {score}");

    assert_eq!(h.store.staged_total(), 0);
    assert_eq!(h.stats.take(), (1, 1));
}

#[tokio::test]
async fn test_subsequent_failure_sets_retried_at() {
    let h = &harness();
    let mut job = JobRecord::new("Typed", vec![]);
    job.retry_count = Some(2);
    job.failed_at = Some(now_epoch() - 100.0);
    job.backtrace = Some(BacktraceOption::Enabled(true));
    h.store.push("default", &[job.to_json().unwrap()]).await.unwrap();
    h.processor.start().await.unwrap();

    eventually(move || async move { h.store.zcard(SortedSet::Retry).await.unwrap() == 1 }).await;
    h.processor.terminate(Duration::from_secs(1)).await;

    let (retried, _) = retry_entries(&h.store).await.remove(0);
    assert_eq!(retried.retry_count, Some(3));
    assert_eq!(retried.failed_at, job.failed_at);
    assert!(retried.retried_at.is_some());
    assert_eq!(retried.error_class.as_deref(), Some("PaymentDeclined"));
    assert_eq!(
        retried.error_backtrace,
        Some(vec!["card declined".to_string()])
    );
}

#[tokio::test]
async fn test_exhausted_job_goes_to_dead_set() {
    let h = &harness();
    let mut job = JobRecord::new("Fail", vec![]).with_retry(RetryPolicy::Limit(2));
    job.retry_count = Some(2);
    h.store.push("default", &[job.to_json().unwrap()]).await.unwrap();
    h.processor.start().await.unwrap();

    eventually(move || async move { h.store.zcard(SortedSet::Dead).await.unwrap() == 1 }).await;
    h.processor.terminate(Duration::from_secs(1)).await;

    let (payload, _) = h.store.zrange(SortedSet::Dead, 0, 0).await.unwrap().remove(0);
    let dead = JobRecord::from_json(&payload).unwrap();
    assert_eq!(dead.id, job.id);
    assert_eq!(dead.retry_count, Some(2));
    assert_eq!(dead.error_message.as_deref(), Some("boom"));
    assert_eq!(h.store.zcard(SortedSet::Retry).await.unwrap(), 0);
    assert_eq!(h.store.staged_total(), 0);
}

#[tokio::test]
async fn test_disabled_retry_discards_job() {
    let h = &harness();
    h.client
        .push(JobRequest::new("Fail", vec![]).retry(RetryPolicy::Disabled))
        .await
        .unwrap();
    h.processor.start().await.unwrap();

    eventually(move || async move { h.stats.pending() == (1, 1) }).await;
    h.processor.terminate(Duration::from_secs(1)).await;

    assert_eq!(h.store.zcard(SortedSet::Retry).await.unwrap(), 0);
    assert_eq!(h.store.zcard(SortedSet::Dead).await.unwrap(), 0);
    assert_eq!(h.store.staged_total(), 0);
    assert_eq!(h.store.queue_size("default").await.unwrap(), 0);
}

#[tokio::test]
async fn test_exhausted_without_dead_set_is_deleted() {
    let h = &harness();
    let mut job = JobRecord::new("Fail", vec![]).with_retry(RetryPolicy::Limit(1));
    job.retry_count = Some(1);
    job.dead = Some(false);
    h.store.push("default", &[job.to_json().unwrap()]).await.unwrap();
    h.processor.start().await.unwrap();

    eventually(move || async move { h.stats.pending() == (1, 1) }).await;
    h.processor.terminate(Duration::from_secs(1)).await;

    assert_eq!(h.store.zcard(SortedSet::Dead).await.unwrap(), 0);
    assert_eq!(h.store.zcard(SortedSet::Retry).await.unwrap(), 0);
    assert_eq!(h.store.staged_total(), 0);
}

#[tokio::test]
async fn test_unknown_class_and_panic_are_ordinary_failures() {
    let h = &harness();
    h.client.push(JobRequest::new("Missing", vec![])).await.unwrap();
    h.client.push(JobRequest::new("Panic", vec![])).await.unwrap();
    h.processor.start().await.unwrap();

    eventually(move || async move { h.store.zcard(SortedSet::Retry).await.unwrap() == 2 }).await;
    h.processor.terminate(Duration::from_secs(1)).await;

    let mut classes: Vec<String> = retry_entries(&h.store)
        .await
        .into_iter()
        .filter_map(|(job, _)| job.error_class)
        .collect();
    classes.sort();
    assert_eq!(classes, vec!["Panic", "UnknownJobClass"]);
}

#[tokio::test]
async fn test_malformed_payload_goes_to_dead_set_unchanged() {
    let h = &harness();
    h.store.push("default", &["not json".to_string()]).await.unwrap();
    h.processor.start().await.unwrap();

    eventually(move || async move { h.store.zcard(SortedSet::Dead).await.unwrap() == 1 }).await;
    h.processor.terminate(Duration::from_secs(1)).await;

    let (payload, _) = h.store.zrange(SortedSet::Dead, 0, 0).await.unwrap().remove(0);
    assert_eq!(payload, "not json");
    assert_eq!(h.store.staged_total(), 0);
}

#[tokio::test]
async fn test_swallowed_failure_is_still_counted() {
    let h = &harness_with(vec![Arc::new(Swallow) as Arc<dyn ServerMiddleware>], 1);
    h.client.push(JobRequest::new("Fail", vec![])).await.unwrap();
    h.processor.start().await.unwrap();

    eventually(move || async move { h.stats.pending() == (1, 1) }).await;
    h.processor.terminate(Duration::from_secs(1)).await;

    // 重试步骤在内层已经处置了暂存记录
    assert_eq!(h.store.zcard(SortedSet::Retry).await.unwrap(), 1);
    assert_eq!(h.store.staged_total(), 0);
}

#[tokio::test]
async fn test_store_failure_during_retry_requeues_job() {
    let h = &harness_with(Vec::new(), 1);
    h.store.inject_failure("retry");
    let jid = h.client.push(JobRequest::new("Fail", vec![])).await.unwrap();
    h.processor.start().await.unwrap();

    eventually(move || async move { h.stats.pending().1 >= 1 }).await;
    h.processor.quiet();
    h.processor.terminate(Duration::from_secs(1)).await;

    // 任务回到队列或仍在暂存列表，绝不会丢失
    let queued = h.store.queue_entries("default", 0, 10).await.unwrap();
    let staged = h.store.staged(IDENTITY, "default");
    let all: Vec<String> = queued.into_iter().chain(staged).collect();
    assert_eq!(all.len(), 1);
    assert_eq!(JobRecord::from_json(&all[0]).unwrap().id, jid);
    assert_eq!(h.store.zcard(SortedSet::Retry).await.unwrap(), 0);
}

#[tokio::test]
async fn test_quiet_stops_fetching() {
    let h = &harness();
    h.processor.start().await.unwrap();
    h.processor.quiet();
    h.processor.quiet();
    assert_eq!(h.processor.state(), ProcessorState::Quiet);

    // 等待执行槽退出当前的阻塞取任务
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.client.push(JobRequest::new("Count", vec![])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.counter.load(Ordering::SeqCst), 0);
    assert_eq!(h.store.queue_size("default").await.unwrap(), 1);
    assert!(h.processor.terminate(Duration::from_secs(1)).await.is_empty());
}

#[tokio::test]
async fn test_terminate_abandons_long_running_jobs() {
    let h = &harness_with(Vec::new(), 1);
    let jid = h.client.push(JobRequest::new("Slow", vec![])).await.unwrap();
    h.processor.start().await.unwrap();

    eventually(move || async move { h.processor.busy() == 1 }).await;
    assert_eq!(h.processor.in_flight_jids(), vec![jid.clone()]);
    assert_eq!(h.processor.work_snapshot()["0"].queue, "default");

    let abandoned = h.processor.terminate(Duration::from_millis(100)).await;
    assert_eq!(abandoned, vec![jid]);
    assert_eq!(h.processor.state(), ProcessorState::Terminated);
    assert_eq!(h.processor.busy(), 0);
    // 被放弃的任务留在暂存列表，等待回收器
    assert_eq!(h.store.staged(IDENTITY, "default").len(), 1);

    h.processor.quiet();
    assert_eq!(h.processor.state(), ProcessorState::Terminated);
}

#[tokio::test]
async fn test_start_twice_fails() {
    let h = &harness();
    h.processor.start().await.unwrap();
    assert!(h.processor.start().await.is_err());
    h.processor.terminate(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_fetch_errors_do_not_stop_slots() {
    let h = &harness_with(Vec::new(), 1);
    h.store.inject_failure("pop_and_stage");
    h.processor.start().await.unwrap();
    h.client.push(JobRequest::new("Count", vec![])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.counter.load(Ordering::SeqCst), 0);

    h.store.clear_failures();
    eventually(move || async move { h.counter.load(Ordering::SeqCst) == 1 }).await;
    h.processor.terminate(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_concurrent_executions_never_exceed_slot_count() {
    let h = &harness_with(Vec::new(), 3);
    let jobs: Vec<JobRequest> = (0..12).map(|_| JobRequest::new("Tracked", vec![])).collect();
    h.client.push_bulk(jobs).await.unwrap();
    h.processor.start().await.unwrap();

    eventually(move || async move { h.stats.pending() == (12, 0) }).await;
    h.processor.terminate(Duration::from_secs(1)).await;

    let peak = h.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak {peak}");
    assert!(peak > 1, "slots never overlapped");
    assert_eq!(h.store.staged_total(), 0);
}

#[tokio::test]
async fn test_three_real_failures_with_two_retries_end_in_dead_set() {
    let h = &harness_with(Vec::new(), 1);
    let jid = h
        .client
        .push(JobRequest::new("Fail", vec![]).retry(RetryPolicy::Limit(2)))
        .await
        .unwrap();
    h.processor.start().await.unwrap();

    for attempt in 1..=2 {
        eventually(move || async move { h.store.zcard(SortedSet::Retry).await.unwrap() == 1 }).await;
        let (job, _) = retry_entries(&h.store).await.remove(0);
        assert_eq!(job.retry_count, Some(attempt));
        // 把重试时间提前，让轮询立即迁回队列
        let promoted = h
            .store
            .promote_due(SortedSet::Retry, now_epoch() + 100_000.0, 100)
            .await
            .unwrap();
        assert_eq!(promoted, 1);
    }

    eventually(move || async move { h.store.zcard(SortedSet::Dead).await.unwrap() == 1 }).await;
    h.processor.terminate(Duration::from_secs(1)).await;

    let (payload, _) = h.store.zrange(SortedSet::Dead, 0, 0).await.unwrap().remove(0);
    let dead = JobRecord::from_json(&payload).unwrap();
    assert_eq!(dead.id, jid);
    assert_eq!(dead.retry_count, Some(2));
    assert!(dead.retried_at.is_some());
    assert_eq!(h.store.zcard(SortedSet::Retry).await.unwrap(), 0);
    assert_eq!(h.store.queue_size("default").await.unwrap(), 0);
    assert_eq!(h.stats.pending(), (3, 3));
}
