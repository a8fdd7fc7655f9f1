use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use conveyor_core::config::{DeadSetConfig, WorkerConfig};
use conveyor_core::models::{now_epoch, JobLocator, JobRecord, WorkEntry};
use conveyor_core::{ConveyorError, ConveyorResult, QueueStore};
use conveyor_infrastructure::MetricsCollector;

use crate::fetcher::{Fetcher, UnitOfWork};
use crate::middleware::{Chain, Disposition, JobContext, JobFailure};
use crate::stats::ProcessStats;

const FETCH_BACKOFF_MIN: Duration = Duration::from_millis(100);
const FETCH_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// 执行池状态，只能向前迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProcessorState {
    Running,
    /// 不再领取新任务，正在执行的任务继续完成
    Quiet,
    Terminated,
}

struct ProcessorInner {
    store: Arc<dyn QueueStore>,
    fetcher: Fetcher,
    chain: Chain,
    dead_set: DeadSetConfig,
    idle_delay: Duration,
    budget: Arc<Semaphore>,
    state: watch::Sender<ProcessorState>,
    work: Mutex<HashMap<String, WorkEntry>>,
    stats: Arc<ProcessStats>,
    metrics: MetricsCollector,
}

/// 工作进程的执行池
///
/// `concurrency` 个执行槽共享同一个信号量预算。每个槽循环：
/// 取得许可、检查状态、取任务、经过中间件链执行、处置暂存记录、释放许可。
pub struct Processor {
    inner: Arc<ProcessorInner>,
    concurrency: usize,
    started: AtomicBool,
    slots: tokio::sync::Mutex<JoinSet<()>>,
}

impl Processor {
    pub fn new(
        store: Arc<dyn QueueStore>,
        fetcher: Fetcher,
        chain: Chain,
        config: &WorkerConfig,
        dead_set: DeadSetConfig,
        stats: Arc<ProcessStats>,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        let (state, _) = watch::channel(ProcessorState::Running);
        Self {
            inner: Arc::new(ProcessorInner {
                store,
                fetcher,
                chain,
                dead_set,
                idle_delay: config.idle_delay(),
                budget: Arc::new(Semaphore::new(concurrency)),
                state,
                work: Mutex::new(HashMap::new()),
                stats,
                metrics: MetricsCollector::new(),
            }),
            concurrency,
            started: AtomicBool::new(false),
            slots: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    /// 启动所有执行槽
    pub async fn start(&self) -> ConveyorResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ConveyorError::AlreadyRunning);
        }
        if self.state() != ProcessorState::Running {
            return Err(ConveyorError::Internal(
                "processor already stopped".to_string(),
            ));
        }

        let mut slots = self.slots.lock().await;
        for slot in 0..self.concurrency {
            let inner = Arc::clone(&self.inner);
            slots.spawn(inner.run_slot(slot));
        }
        self.inner.metrics.set_concurrency(self.concurrency);
        info!(concurrency = self.concurrency, "执行池已启动");
        Ok(())
    }

    pub fn state(&self) -> ProcessorState {
        *self.inner.state.borrow()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// 停止领取新任务；已经静默或终止时什么都不做
    pub fn quiet(&self) {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == ProcessorState::Running {
                *state = ProcessorState::Quiet;
                true
            } else {
                false
            }
        });
        if changed {
            info!("执行池进入静默状态，不再领取新任务");
        }
    }

    /// 静默后等待执行中的任务完成，超时则强制中止，返回被放弃的任务ID
    ///
    /// 被放弃的任务留在暂存列表，进程注销后由回收器放回队列，可能被重复执行。
    pub async fn terminate(&self, timeout: Duration) -> Vec<String> {
        self.quiet();
        let mut slots = self.slots.lock().await;

        let drained = tokio::time::timeout(timeout, async {
            while slots.join_next().await.is_some() {}
        })
        .await;

        let abandoned = match drained {
            Ok(()) => Vec::new(),
            Err(_) => {
                let jids = self.in_flight_jids();
                warn!(
                    abandoned = ?jids,
                    timeout_secs = timeout.as_secs(),
                    "关闭超时，强制中止仍在执行的任务，这些任务之后可能被重复执行"
                );
                slots.abort_all();
                while slots.join_next().await.is_some() {}
                self.inner.work_map().clear();
                jids
            }
        };

        self.inner.state.send_replace(ProcessorState::Terminated);
        self.inner.metrics.set_busy(0);
        info!("执行池已终止");
        abandoned
    }

    /// 正在执行的任务数
    pub fn busy(&self) -> usize {
        self.inner.work_map().len()
    }

    /// 执行中任务的快照，键为执行槽编号
    pub fn work_snapshot(&self) -> HashMap<String, WorkEntry> {
        self.inner.work_map().clone()
    }

    pub fn in_flight_jids(&self) -> Vec<String> {
        let mut jids: Vec<String> = self
            .inner
            .work_map()
            .values()
            .filter_map(|entry| JobLocator::parse(&entry.payload).map(|l| l.id))
            .collect();
        jids.sort();
        jids
    }
}

impl ProcessorInner {
    fn work_map(&self) -> MutexGuard<'_, HashMap<String, WorkEntry>> {
        self.work.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_running(&self) -> bool {
        *self.state.borrow() == ProcessorState::Running
    }

    async fn run_slot(self: Arc<Self>, slot: usize) {
        let mut state_rx = self.state.subscribe();
        let mut backoff = FETCH_BACKOFF_MIN;

        while self.is_running() {
            let Ok(permit) = Arc::clone(&self.budget).acquire_owned().await else {
                break;
            };
            if !self.is_running() {
                break;
            }

            match self.fetcher.fetch().await {
                Ok(Some(work)) => {
                    backoff = FETCH_BACKOFF_MIN;
                    if !self.is_running() {
                        self.return_unstarted(&work).await;
                        break;
                    }
                    self.process(slot, work).await;
                    drop(permit);
                }
                Ok(None) => {
                    drop(permit);
                    pause(&mut state_rx, self.idle_delay).await;
                }
                Err(e) => {
                    drop(permit);
                    error!(slot, error = %e, retry_in_ms = backoff.as_millis() as u64, "取任务失败");
                    self.metrics.record_store_error("fetch");
                    pause(&mut state_rx, backoff).await;
                    backoff = (backoff * 2).min(FETCH_BACKOFF_MAX);
                }
            }
        }
        debug!(slot, "执行槽退出");
    }

    /// 静默之后才取到的任务原样放回队列
    async fn return_unstarted(&self, work: &UnitOfWork) {
        match work.requeue().await {
            Ok(_) => debug!(queue = %work.queue, "静默后取到的任务已放回队列"),
            Err(e) => error!(
                queue = %work.queue,
                error = %e,
                "放回队列失败，任务留在暂存列表等待回收"
            ),
        }
    }

    async fn process(&self, slot: usize, work: UnitOfWork) {
        let started = Instant::now();
        let job = match JobRecord::from_json(&work.payload) {
            Ok(job) => job,
            Err(e) => {
                self.bury_malformed(&work, &e).await;
                self.stats.record(true);
                return;
            }
        };
        let class = job.class.clone();
        debug!(jid = %job.id, class = %class, queue = %work.queue, "开始执行任务");

        self.track(slot, &work);
        let mut ctx = JobContext::new(job, &work.queue, &work.identity, &work.payload);
        let result = match AssertUnwindSafe(self.chain.invoke(&mut ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(JobFailure::from_panic(panic)),
        };
        // 失败发生在重试步骤外层（例如用户中间件出错）时由这里补做处置
        if let Err(failure) = &result {
            if ctx.disposition.is_none() {
                self.chain.retry().handle_failure(&mut ctx, failure).await;
            }
        }

        self.resolve_staging(&ctx, &work).await;
        self.untrack(slot);

        let failed = ctx.failure.is_some();
        self.stats.record(failed);
        self.metrics
            .record_job(&class, &work.queue, started.elapsed(), !failed);
        debug!(
            jid = %ctx.job.id,
            class = %class,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "任务执行结束"
        );
    }

    async fn resolve_staging(&self, ctx: &JobContext, work: &UnitOfWork) {
        match ctx.disposition {
            None => match work.acknowledge().await {
                Ok(true) => {}
                Ok(false) => warn!(
                    jid = %ctx.job.id,
                    "暂存记录已不存在，任务可能已被回收并重新入队"
                ),
                Err(e) => {
                    error!(
                        jid = %ctx.job.id,
                        error = %e,
                        "确认任务失败，任务留在暂存列表，之后可能被重复执行"
                    );
                    self.metrics.record_store_error("acknowledge");
                }
            },
            Some(Disposition::Unresolved) => match work.requeue().await {
                Ok(_) => warn!(jid = %ctx.job.id, "失败处置写入出错，任务已放回队列"),
                Err(e) => {
                    error!(
                        jid = %ctx.job.id,
                        error = %e,
                        "放回队列也失败，任务留在暂存列表等待回收"
                    );
                    self.metrics.record_store_error("requeue");
                }
            },
            Some(_) => {}
        }
    }

    /// 不是合法任务记录的负载无法记录重试信息，直接原样移入死信集合
    async fn bury_malformed(&self, work: &UnitOfWork, reason: &ConveyorError) {
        error!(
            queue = %work.queue,
            error = %reason,
            payload = %work.payload,
            "无法解析的任务负载，移入死信集合"
        );
        match self
            .store
            .kill(
                &work.identity,
                &work.queue,
                &work.payload,
                &work.payload,
                now_epoch(),
                &self.dead_set,
            )
            .await
        {
            Ok(_) => self.metrics.record_dead(reason.kind()),
            Err(e) => {
                error!(error = %e, "移入死信集合失败，负载留在暂存列表");
                self.metrics.record_store_error("kill");
            }
        }
    }

    fn track(&self, slot: usize, work: &UnitOfWork) {
        let busy = {
            let mut map = self.work_map();
            map.insert(
                slot.to_string(),
                WorkEntry {
                    queue: work.queue.clone(),
                    payload: work.payload.clone(),
                    run_at: now_epoch(),
                },
            );
            map.len()
        };
        self.metrics.set_busy(busy);
    }

    fn untrack(&self, slot: usize) {
        let busy = {
            let mut map = self.work_map();
            map.remove(&slot.to_string());
            map.len()
        };
        self.metrics.set_busy(busy);
    }
}

/// 等待一段时间，状态变化时提前返回
async fn pause(state_rx: &mut watch::Receiver<ProcessorState>, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = state_rx.changed() => {}
    }
}
