use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use conveyor_core::models::JobLocator;
use conveyor_core::{ConveyorResult, QueueStore};
use conveyor_infrastructure::MetricsCollector;

use crate::poller::jittered;

/// 孤儿任务回收器
///
/// 进程崩溃后其暂存列表无人处理。回收器定期扫描所有暂存列表，
/// 属主的注册表条目已过期的，逐条原子地放回队列前端。
/// 多个回收器并发执行也是安全的：每条记录只会被一次移动操作取走。
pub struct OrphanReaper {
    store: Arc<dyn QueueStore>,
    interval: Duration,
    metrics: MetricsCollector,
}

impl OrphanReaper {
    pub fn new(store: Arc<dyn QueueStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            metrics: MetricsCollector::new(),
        }
    }

    /// 执行一次回收，返回放回队列的任务数
    pub async fn reap_once(&self) -> ConveyorResult<usize> {
        let staging = self.store.staging_lists().await?;
        let mut liveness: HashMap<String, bool> = HashMap::new();
        let mut restored = 0;

        for (identity, queue) in staging {
            let alive = match liveness.get(&identity) {
                Some(alive) => *alive,
                None => {
                    let alive = self.store.process_alive(&identity).await?;
                    liveness.insert(identity.clone(), alive);
                    alive
                }
            };
            if alive {
                continue;
            }

            while let Some(payload) = self.store.restore_staged(&identity, &queue).await? {
                let jid = JobLocator::parse(&payload)
                    .map(|l| l.id)
                    .unwrap_or_default();
                warn!(
                    identity = %identity,
                    queue = %queue,
                    jid = %jid,
                    "回收已死进程的在途任务，该任务可能被重复执行"
                );
                restored += 1;
            }
        }

        if restored > 0 {
            info!(restored, "孤儿任务已放回队列");
            self.metrics.record_reaped(restored);
        } else {
            debug!("没有需要回收的孤儿任务");
        }
        Ok(restored)
    }

    pub fn start(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "孤儿任务回收器启动");
            loop {
                let wait = jittered(self.interval.as_secs_f64());
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown_rx.recv() => {
                        info!("孤儿任务回收器退出");
                        break;
                    }
                }

                if let Err(e) = self.reap_once().await {
                    error!(error = %e, "孤儿任务回收失败");
                    self.metrics.record_store_error("reap");
                }
            }
        })
    }
}
