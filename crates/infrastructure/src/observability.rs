//! 运行指标与 Prometheus 导出
//!
//! 指标名统一以 `conveyor_` 开头，按任务类型和队列打标签。

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// 启动 Prometheus 拉取端点，需要在 tokio 运行时中调用
pub fn init_prometheus_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;
    info!("Prometheus指标端点已启动: http://{}/metrics", addr);
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// 任务执行完成（成功或失败）
    pub fn record_job(&self, class: &str, queue: &str, duration: Duration, success: bool) {
        let status = if success { "success" } else { "failure" };
        counter!(
            "conveyor_jobs_total",
            "class" => class.to_string(),
            "queue" => queue.to_string(),
            "status" => status
        )
        .increment(1);
        histogram!(
            "conveyor_job_duration_seconds",
            "class" => class.to_string(),
            "queue" => queue.to_string()
        )
        .record(duration.as_secs_f64());
    }

    pub fn record_retry_scheduled(&self, class: &str, retry_count: u32) {
        counter!("conveyor_job_retries_total", "class" => class.to_string()).increment(1);
        histogram!("conveyor_job_retry_count", "class" => class.to_string())
            .record(f64::from(retry_count));
    }

    pub fn record_dead(&self, class: &str) {
        counter!("conveyor_jobs_dead_total", "class" => class.to_string()).increment(1);
    }

    pub fn record_discarded(&self, class: &str) {
        counter!("conveyor_jobs_discarded_total", "class" => class.to_string()).increment(1);
    }

    pub fn record_promoted(&self, set: &str, count: usize) {
        counter!("conveyor_jobs_promoted_total", "set" => set.to_string()).increment(count as u64);
    }

    pub fn record_reaped(&self, count: usize) {
        counter!("conveyor_jobs_reaped_total").increment(count as u64);
    }

    pub fn record_store_error(&self, operation: &'static str) {
        counter!("conveyor_store_errors_total", "operation" => operation).increment(1);
    }

    pub fn set_busy(&self, busy: usize) {
        gauge!("conveyor_busy_slots").set(busy as f64);
    }

    pub fn set_concurrency(&self, concurrency: usize) {
        gauge!("conveyor_concurrency").set(concurrency as f64);
    }
}
