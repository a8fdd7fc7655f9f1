use std::time::Instant;

use async_trait::async_trait;
use tracing::warn;

use super::{JobContext, JobResult, Next, ServerMiddleware};

/// 记录失败任务，位于重试步骤外层，日志中带有处置结果
pub struct FailureLogger;

#[async_trait]
impl ServerMiddleware for FailureLogger {
    async fn call(&self, ctx: &mut JobContext, next: Next<'_>) -> JobResult {
        let started = Instant::now();
        let result = next.run(ctx).await;
        if let Err(failure) = &result {
            warn!(
                jid = %ctx.job.id,
                class = %ctx.job.class,
                queue = %ctx.queue,
                error_class = %failure.class,
                error = %failure.message,
                elapsed_ms = started.elapsed().as_millis() as u64,
                disposition = ?ctx.disposition,
                "任务执行失败"
            );
        }
        result
    }
}
