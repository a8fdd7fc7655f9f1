use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use conveyor_core::config::SchedulerConfig;
use conveyor_core::models::now_epoch;
use conveyor_core::{ConveyorResult, QueueStore, SortedSet};
use conveyor_infrastructure::MetricsCollector;

/// 轮询器负责迁移的集合
const POLLED_SETS: [SortedSet; 2] = [SortedSet::Schedule, SortedSet::Retry];

/// 在 `[0.5 * average, 1.5 * average]` 内均匀取值
///
/// 多个进程各自随机间隔，平均下来整个集群每 `average` 秒左右检查一次。
pub fn jittered(average: f64) -> Duration {
    let average = if average.is_finite() { average.max(0.0) } else { 0.0 };
    let factor: f64 = rand::rng().random_range(0.5..1.5);
    Duration::from_secs_f64(average * factor)
}

/// 定时与重试任务轮询器
pub struct Poller {
    store: Arc<dyn QueueStore>,
    config: SchedulerConfig,
    metrics: MetricsCollector,
}

impl Poller {
    pub fn new(store: Arc<dyn QueueStore>, config: SchedulerConfig) -> Self {
        Self {
            store,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    /// 迁移所有到期任务，返回迁移数量
    ///
    /// 两个集合分别处理，一个失败不影响另一个；存在失败时返回第一个错误，
    /// 未迁移的记录留在集合中等待下一轮。
    pub async fn enqueue_due(&self, now: f64) -> ConveyorResult<usize> {
        let mut total = 0;
        let mut first_error = None;
        let batch = self.config.batch_size.max(1);

        for set in POLLED_SETS {
            loop {
                match self.store.promote_due(set, now, batch).await {
                    Ok(promoted) => {
                        if promoted > 0 {
                            debug!(set = %set, promoted, "迁移到期任务");
                            self.metrics.record_promoted(set.as_str(), promoted);
                        }
                        total += promoted;
                        if promoted < batch {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(set = %set, error = %e, "迁移到期任务失败");
                        self.metrics.record_store_error("promote_due");
                        first_error.get_or_insert(e);
                        break;
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// 本轮的平均轮询间隔（秒）
    ///
    /// 显式配置时直接使用；否则按存活进程数放大，进程越多单个进程查得越少。
    pub async fn average_interval(&self) -> f64 {
        if let Some(average) = self.config.poll_interval_average {
            return average;
        }
        let processes = match self.store.live_process_count().await {
            Ok(count) => count.max(1),
            Err(e) => {
                debug!(error = %e, "读取存活进程数失败，按单进程计算轮询间隔");
                1
            }
        };
        self.config.scaled_poll_interval * processes as f64
    }

    /// 首次轮询前的等待：`initial_wait + random(0..initial_wait)`
    pub fn initial_wait(&self) -> Duration {
        let base = self.config.initial_wait.max(0.0);
        let extra: f64 = if base > 0.0 {
            rand::rng().random_range(0.0..base)
        } else {
            0.0
        };
        Duration::from_secs_f64(base + extra)
    }

    pub fn start(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let initial_wait = self.initial_wait();
            info!(initial_wait_ms = initial_wait.as_millis() as u64, "定时任务轮询器启动");
            tokio::select! {
                _ = tokio::time::sleep(initial_wait) => {}
                _ = shutdown_rx.recv() => {
                    info!("定时任务轮询器退出");
                    return;
                }
            }

            loop {
                if let Ok(promoted) = self.enqueue_due(now_epoch()).await {
                    if promoted > 0 {
                        info!(promoted, "到期任务已迁回队列");
                    }
                }

                let interval = jittered(self.average_interval().await);
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.recv() => {
                        info!("定时任务轮询器退出");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_stays_within_bounds() {
        for _ in 0..200 {
            let interval = jittered(10.0).as_secs_f64();
            assert!((5.0..=15.0).contains(&interval), "interval {interval}");
        }
        assert_eq!(jittered(f64::NAN), Duration::ZERO);
        assert_eq!(jittered(-3.0), Duration::ZERO);
    }
}
