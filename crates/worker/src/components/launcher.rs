use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use conveyor_core::config::AppConfig;
use conveyor_core::models::{now_epoch, ProcessInfo};
use conveyor_core::{ConveyorError, ConveyorResult, HandlerRegistry, QueueStore};
use conveyor_scheduler::{OrphanReaper, Poller};

use super::heartbeat_manager::{HeartbeatManager, LifecycleEvent};
use super::processor::Processor;
use crate::fetcher::{Fetcher, QueueOrder};
use crate::middleware::{Chain, RetryMiddleware, ServerMiddleware};
use crate::stats::ProcessStats;

/// 工作进程的组装与生命周期管理
///
/// 持有执行池、心跳、定时任务轮询器与孤儿回收器。
/// 启动时同步写入第一次心跳，失败则启动失败；
/// 关闭顺序为：静默并立即上报、停止轮询器与回收器、终止执行池、停止心跳、注销。
/// 执行池收尾期间心跳照常续期，其他进程的回收器不会把仍在执行的任务放回队列。
pub struct Launcher {
    store: Arc<dyn QueueStore>,
    config: AppConfig,
    info: ProcessInfo,
    processor: Arc<Processor>,
    heartbeat: Arc<HeartbeatManager>,
    poller: Option<Arc<Poller>>,
    reaper: Option<Arc<OrphanReaper>>,
    shutdown_tx: broadcast::Sender<()>,
    heartbeat_stop_tx: broadcast::Sender<()>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    events_tx: mpsc::UnboundedSender<LifecycleEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<LifecycleEvent>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    is_running: RwLock<bool>,
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

impl Launcher {
    /// `middleware` 为用户中间件，按顺序从外到内排列
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: Arc<HandlerRegistry>,
        config: &AppConfig,
        middleware: Vec<Arc<dyn ServerMiddleware>>,
    ) -> ConveyorResult<Self> {
        let worker = &config.worker;
        let queues = worker.parsed_queues()?;
        let order = QueueOrder::new(queues, worker.strict_ordering);

        let hostname = local_hostname();
        let pid = std::process::id();
        let identity = worker
            .identity
            .clone()
            .unwrap_or_else(|| ProcessInfo::default_identity(&hostname, pid));
        let info = ProcessInfo {
            identity: identity.clone(),
            hostname,
            pid,
            tag: worker.tag.clone(),
            labels: worker.labels.clone(),
            concurrency: worker.concurrency,
            queues: order.queue_names(),
            started_at: now_epoch(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };

        let retry = Arc::new(RetryMiddleware::new(
            store.clone(),
            config.retry.clone(),
            config.dead_set.clone(),
        ));
        let chain = Chain::new(middleware, retry, registry);
        let fetcher = Fetcher::new(store.clone(), identity, order, worker.fetch_timeout());
        let stats = Arc::new(ProcessStats::new());
        let processor = Arc::new(Processor::new(
            store.clone(),
            fetcher,
            chain,
            worker,
            config.dead_set.clone(),
            stats.clone(),
        ));
        let heartbeat = Arc::new(HeartbeatManager::new(
            store.clone(),
            &info,
            processor.clone(),
            stats,
            worker,
        )?);

        let scheduler = &config.scheduler;
        let poller = scheduler
            .enabled
            .then(|| Arc::new(Poller::new(store.clone(), scheduler.clone())));
        let reaper = scheduler
            .reaper_enabled
            .then(|| Arc::new(OrphanReaper::new(store.clone(), scheduler.reaper_interval())));

        let (shutdown_tx, _) = broadcast::channel(1);
        let (heartbeat_stop_tx, _) = broadcast::channel(1);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            store,
            config: config.clone(),
            info,
            processor,
            heartbeat,
            poller,
            reaper,
            shutdown_tx,
            heartbeat_stop_tx,
            heartbeat_task: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(events_rx),
            tasks: Mutex::new(Vec::new()),
            is_running: RwLock::new(false),
        })
    }

    pub fn identity(&self) -> &str {
        &self.info.identity
    }

    pub fn info(&self) -> &ProcessInfo {
        &self.info
    }

    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub async fn start(&self) -> ConveyorResult<()> {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            return Err(ConveyorError::AlreadyRunning);
        }

        info!(
            identity = %self.info.identity,
            concurrency = self.info.concurrency,
            queues = ?self.info.queues,
            "启动工作进程"
        );
        match self.heartbeat.beat_with_timeout().await {
            Ok(signals) => {
                for signal in signals {
                    let _ = self.events_tx.send(signal.into());
                }
            }
            Err(e) => {
                error!(error = %e, "首次心跳失败，无法注册进程");
                return Err(e);
            }
        }

        self.processor.start().await?;

        *self.heartbeat_task.lock().await = Some(
            self.heartbeat
                .clone()
                .start(self.heartbeat_stop_tx.subscribe(), self.events_tx.clone()),
        );
        let mut tasks = self.tasks.lock().await;
        if let Some(poller) = &self.poller {
            tasks.push(poller.clone().start(self.shutdown_tx.subscribe()));
        }
        if let Some(reaper) = &self.reaper {
            tasks.push(reaper.clone().start(self.shutdown_tx.subscribe()));
        }

        *is_running = true;
        info!(identity = %self.info.identity, "工作进程启动成功");
        Ok(())
    }

    /// 停止领取新任务，下次心跳会把静默状态写入注册表
    pub fn quiet(&self) {
        self.processor.quiet();
    }

    pub async fn stop(&self) -> ConveyorResult<()> {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            return Ok(());
        }

        info!(identity = %self.info.identity, "停止工作进程");
        self.processor.quiet();
        // 立即上报静默状态，不等下一次心跳
        if let Err(e) = self.heartbeat.beat_with_timeout().await {
            warn!(error = %e, "上报静默状态失败");
        }

        let _ = self.shutdown_tx.send(());
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "后台任务异常退出");
            }
        }

        let abandoned = self
            .processor
            .terminate(self.config.worker.shutdown_timeout())
            .await;
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "部分任务未在关闭超时内完成");
        }

        let _ = self.heartbeat_stop_tx.send(());
        if let Some(handle) = self.heartbeat_task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "心跳任务异常退出");
            }
        }

        if let Err(e) = self.heartbeat.flush_stats().await {
            let (processed, failed) = self.heartbeat.pending_stats();
            warn!(error = %e, processed, failed, "关闭前写入处理统计失败，这部分计数将丢失");
        }
        if let Err(e) = self.store.deregister(&self.info.identity).await {
            warn!(error = %e, "注销进程失败，注册表条目将在过期后自动失效");
        }

        *is_running = false;
        info!(identity = %self.info.identity, "工作进程已停止");
        Ok(())
    }

    /// 运行直到 `shutdown` 完成、收到远程停止信号或心跳丢失，然后按顺序关闭
    ///
    /// 心跳丢失时返回 `ConveyorError::HeartbeatLost`。
    pub async fn run_until<F>(&self, shutdown: F) -> ConveyorResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut events = self.events_rx.lock().await;

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("收到关闭请求");
                    break Ok(());
                }
                event = events.recv() => match event {
                    Some(LifecycleEvent::Quiet) => self.quiet(),
                    Some(LifecycleEvent::Stop) => {
                        info!("收到远程停止信号");
                        break Ok(());
                    }
                    Some(LifecycleEvent::HeartbeatLost(failures)) => {
                        break Err(ConveyorError::HeartbeatLost { failures });
                    }
                    None => break Ok(()),
                },
            }
        };
        drop(events);

        self.stop().await?;
        outcome
    }
}
