//! 重试与退避
//!
//! 失败任务的处置顺序：
//! 1. 禁用重试：从暂存列表删除，不进死信集合；
//! 2. 重试次数已达上限：记录错误信息后移入死信集合（`dead: false` 时直接删除）；
//! 3. 否则递增 `retry_count`，按退避时间移入重试集合。
//!
//! 每一步都是一次原子的存储操作，暂存记录与目标位置不会同时存在。

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::{error, info, warn};

use conveyor_core::config::{DeadSetConfig, RetryConfig};
use conveyor_core::models::now_epoch;
use conveyor_core::{ConveyorResult, QueueStore};
use conveyor_infrastructure::MetricsCollector;

use super::{Disposition, JobContext, JobFailure, JobResult, Next, ServerMiddleware};

/// 第 `count` 次重试前的等待秒数
///
/// `count^4 + 15 + jitter`，`jitter = roll * (count + 1)`，`roll` 取 0..10。
/// 抖动上限为 `(count+1)^4 - count^4 - 1`，保证延迟随重试次数严格递增。
pub fn backoff_delay(count: u32, roll: u32) -> f64 {
    let c = f64::from(count);
    let base = c.powi(4) + 15.0;
    let cap = (c + 1.0).powi(4) - c.powi(4) - 1.0;
    let jitter = (f64::from(roll) * (c + 1.0)).min(cap);
    base + jitter
}

fn jittered_backoff(count: u32) -> f64 {
    let roll = rand::rng().random_range(0..10);
    backoff_delay(count, roll)
}

/// 按字节截断，不切断多字节字符
fn truncate_bytes(message: &str, max_bytes: usize) -> String {
    if message.len() <= max_bytes {
        return message.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

/// 链中最内层的内置步骤
pub struct RetryMiddleware {
    store: Arc<dyn QueueStore>,
    config: RetryConfig,
    dead_set: DeadSetConfig,
    metrics: MetricsCollector,
}

impl RetryMiddleware {
    pub fn new(store: Arc<dyn QueueStore>, config: RetryConfig, dead_set: DeadSetConfig) -> Self {
        Self {
            store,
            config,
            dead_set,
            metrics: MetricsCollector::new(),
        }
    }

    /// 记录失败并处置暂存记录，结果写入 `ctx.disposition`
    pub async fn handle_failure(&self, ctx: &mut JobContext, failure: &JobFailure) {
        ctx.failure = Some(failure.clone());
        let disposition = match self.dispose(ctx, failure).await {
            Ok(disposition) => disposition,
            Err(e) => {
                error!(
                    jid = %ctx.job.id,
                    class = %ctx.job.class,
                    error = %e,
                    "写入失败处置结果出错，暂存记录未处理"
                );
                self.metrics.record_store_error("retry");
                Disposition::Unresolved
            }
        };
        ctx.disposition = Some(disposition);
    }

    async fn dispose(
        &self,
        ctx: &mut JobContext,
        failure: &JobFailure,
    ) -> ConveyorResult<Disposition> {
        if ctx.job.retry.is_disabled() {
            let removed = self
                .store
                .acknowledge(&ctx.identity, &ctx.queue, &ctx.raw)
                .await?;
            self.metrics.record_discarded(&ctx.job.class);
            return Ok(if removed {
                Disposition::Discarded
            } else {
                Disposition::Vanished
            });
        }

        let now = now_epoch();
        self.record_error(ctx, failure, now);

        let count = ctx.job.retry_count.unwrap_or(0);
        let exhausted = ctx
            .job
            .retry
            .max_retries(self.config.default_max_retries)
            .is_some_and(|max| count >= max);

        if exhausted {
            return self.retries_exhausted(ctx, now).await;
        }

        let next_count = count.saturating_add(1);
        ctx.job.retry_count = Some(next_count);
        let at = now + jittered_backoff(next_count);
        let updated = ctx.job.to_json()?;

        let moved = self
            .store
            .retry(&ctx.identity, &ctx.queue, &ctx.raw, &updated, at)
            .await?;
        if !moved {
            return Ok(Disposition::Vanished);
        }
        self.metrics.record_retry_scheduled(&ctx.job.class, next_count);
        info!(
            jid = %ctx.job.id,
            class = %ctx.job.class,
            retry_count = next_count,
            delay_secs = at - now,
            "任务将在退避后重试"
        );
        Ok(Disposition::Retried {
            retry_count: next_count,
            at,
        })
    }

    async fn retries_exhausted(
        &self,
        ctx: &mut JobContext,
        now: f64,
    ) -> ConveyorResult<Disposition> {
        if !ctx.job.goes_to_dead_set() {
            let removed = self
                .store
                .acknowledge(&ctx.identity, &ctx.queue, &ctx.raw)
                .await?;
            self.metrics.record_discarded(&ctx.job.class);
            info!(jid = %ctx.job.id, class = %ctx.job.class, "重试耗尽，任务已丢弃");
            return Ok(if removed {
                Disposition::Discarded
            } else {
                Disposition::Vanished
            });
        }

        let updated = ctx.job.to_json()?;
        let moved = self
            .store
            .kill(&ctx.identity, &ctx.queue, &ctx.raw, &updated, now, &self.dead_set)
            .await?;
        if !moved {
            return Ok(Disposition::Vanished);
        }
        self.metrics.record_dead(&ctx.job.class);
        warn!(
            jid = %ctx.job.id,
            class = %ctx.job.class,
            retry_count = ctx.job.retry_count(),
            "重试耗尽，任务已移入死信集合"
        );
        Ok(Disposition::Dead)
    }

    fn record_error(&self, ctx: &mut JobContext, failure: &JobFailure, now: f64) {
        let job = &mut ctx.job;
        job.error_class = Some(failure.class.clone());
        job.error_message = Some(truncate_bytes(
            &failure.message,
            self.config.max_error_message_bytes,
        ));
        if job.failed_at.is_some() {
            job.retried_at = Some(now);
        } else {
            job.failed_at = Some(now);
        }
        if let Some(lines) = job
            .backtrace
            .and_then(|option| option.lines(self.config.max_backtrace_lines))
        {
            job.error_backtrace = Some(failure.backtrace.iter().take(lines).cloned().collect());
        }
    }
}

#[async_trait]
impl ServerMiddleware for RetryMiddleware {
    async fn call(&self, ctx: &mut JobContext, next: Next<'_>) -> JobResult {
        let result = next.run(ctx).await;
        if let Err(failure) = &result {
            self.handle_failure(ctx, failure).await;
        }
        result
    }
}
