use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use conveyor_core::config::WorkerConfig;
use conveyor_core::models::{Heartbeat, ProcessInfo, ProcessSignal};
use conveyor_core::{ConveyorError, ConveyorResult, QueueStore};
use conveyor_infrastructure::MetricsCollector;

use super::processor::{Processor, ProcessorState};
use crate::stats::ProcessStats;

/// 心跳循环通知启动器的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// 远程静默信号
    Quiet,
    /// 远程停止信号
    Stop,
    /// 心跳连续失败达到上限
    HeartbeatLost(u32),
}

impl From<ProcessSignal> for LifecycleEvent {
    fn from(signal: ProcessSignal) -> Self {
        match signal {
            ProcessSignal::Quiet => LifecycleEvent::Quiet,
            ProcessSignal::Stop => LifecycleEvent::Stop,
        }
    }
}

/// 进程注册表心跳
///
/// 每次心跳刷新注册表条目（忙碌数、静默标志、执行中任务）并续期，
/// 同时写入处理统计、取回远程信号。
pub struct HeartbeatManager {
    store: Arc<dyn QueueStore>,
    identity: String,
    info: String,
    processor: Arc<Processor>,
    stats: Arc<ProcessStats>,
    interval: Duration,
    ttl: Duration,
    max_failures: u32,
    metrics: MetricsCollector,
}

impl HeartbeatManager {
    pub fn new(
        store: Arc<dyn QueueStore>,
        info: &ProcessInfo,
        processor: Arc<Processor>,
        stats: Arc<ProcessStats>,
        config: &WorkerConfig,
    ) -> ConveyorResult<Self> {
        Ok(Self {
            store,
            identity: info.identity.clone(),
            info: serde_json::to_string(info)?,
            processor,
            stats,
            interval: config.heartbeat_interval(),
            ttl: config.heartbeat_ttl(),
            max_failures: config.max_heartbeat_failures.max(1),
            metrics: MetricsCollector::new(),
        })
    }

    /// 写入一次心跳，返回收到的远程信号
    pub async fn beat(&self) -> ConveyorResult<Vec<ProcessSignal>> {
        let work = self.processor.work_snapshot();
        let quiet = self.processor.state() != ProcessorState::Running;
        let heartbeat = Heartbeat::now(work.len(), quiet);

        self.store
            .heartbeat(&self.identity, &self.info, &heartbeat, &work, self.ttl)
            .await?;
        self.flush_stats().await?;

        let signals = self.store.pop_signals(&self.identity).await?;
        Ok(signals
            .iter()
            .filter_map(|raw| {
                let signal = ProcessSignal::parse(raw);
                if signal.is_none() {
                    warn!(signal = %raw, "忽略无法识别的远程信号");
                }
                signal
            })
            .collect())
    }

    /// 单次心跳最多等待一个心跳间隔，超时计为失败
    ///
    /// 存储不响应时调用会一直挂起，不限时就永远数不到失败次数。
    pub async fn beat_with_timeout(&self) -> ConveyorResult<Vec<ProcessSignal>> {
        match tokio::time::timeout(self.interval, self.beat()).await {
            Ok(result) => result,
            Err(_) => Err(ConveyorError::Connection(format!(
                "heartbeat timed out after {}ms",
                self.interval.as_millis()
            ))),
        }
    }

    /// 把进程内累计的处理数写入存储，失败时计数保留到下次
    pub async fn flush_stats(&self) -> ConveyorResult<()> {
        let (processed, failed) = self.stats.take();
        if processed == 0 && failed == 0 {
            return Ok(());
        }
        if let Err(e) = self
            .store
            .incr_stats(processed, failed, chrono::Utc::now())
            .await
        {
            self.stats.restore(processed, failed);
            return Err(e);
        }
        debug!(processed, failed, "处理统计已写入");
        Ok(())
    }

    /// 尚未写入存储的 (processed, failed)
    pub fn pending_stats(&self) -> (u64, u64) {
        self.stats.pending()
    }

    pub fn start(
        self: Arc<Self>,
        mut shutdown_rx: broadcast::Receiver<()>,
        events: mpsc::UnboundedSender<LifecycleEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次心跳已由启动器同步写入
            ticker.tick().await;
            let mut failures: u32 = 0;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.beat_with_timeout().await {
                            Ok(signals) => {
                                if failures > 0 {
                                    info!(failures, "心跳恢复");
                                }
                                failures = 0;
                                for signal in signals {
                                    info!(signal = signal.as_str(), "收到远程信号");
                                    let _ = events.send(signal.into());
                                }
                            }
                            Err(e) => {
                                failures += 1;
                                self.metrics.record_store_error("heartbeat");
                                warn!(
                                    failures,
                                    max_failures = self.max_failures,
                                    error = %e,
                                    "心跳失败"
                                );
                                if failures >= self.max_failures {
                                    error!(failures, "心跳连续失败，进程无法证明存活");
                                    let _ = events.send(LifecycleEvent::HeartbeatLost(failures));
                                    break;
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("心跳任务退出");
                        break;
                    }
                }
            }
        })
    }
}
