//! # 服务端中间件链
//!
//! 每个任务都经过同一条链：用户中间件（最外层）、失败日志、重试管理，
//! 最后是处理器调用。中间件可以在 `next` 前后做事、修改任务元数据、
//! 吞掉失败（返回 `Ok`）或继续向外传播。
//!
//! 重试步骤把失败与处置结果记录在 [`JobContext`] 上，
//! 即使外层中间件吞掉了失败，处理器也能据此统计。
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use conveyor_worker::middleware::{JobContext, JobResult, Next, ServerMiddleware};
//!
//! struct Timing;
//!
//! #[async_trait]
//! impl ServerMiddleware for Timing {
//!     async fn call(&self, ctx: &mut JobContext, next: Next<'_>) -> JobResult {
//!         let started = std::time::Instant::now();
//!         let result = next.run(ctx).await;
//!         tracing::info!(jid = %ctx.job.id, elapsed = ?started.elapsed(), "done");
//!         result
//!     }
//! }
//! ```

pub mod logging;
pub mod retry;

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use conveyor_core::models::JobRecord;
use conveyor_core::{ConveyorError, HandlerRegistry, JobError};

pub use logging::FailureLogger;
pub use retry::{backoff_delay, RetryMiddleware};

/// 一次任务失败
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    /// 错误类别，写入 `error_class`
    pub class: String,
    pub message: String,
    /// 错误来源链，外层在前
    pub backtrace: Vec<String>,
}

impl JobFailure {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            class: class.into(),
            backtrace: vec![message.clone()],
            message,
        }
    }

    /// 从处理器返回的错误构造，`JobError` 与 `ConveyorError` 保留各自的类别
    pub fn from_error(err: &anyhow::Error) -> Self {
        let class = if let Some(job_error) = err.downcast_ref::<JobError>() {
            job_error.class.clone()
        } else if let Some(conveyor_error) = err.downcast_ref::<ConveyorError>() {
            conveyor_error.kind().to_string()
        } else {
            "JobError".to_string()
        };
        Self {
            class,
            message: err.to_string(),
            backtrace: err.chain().map(|cause| cause.to_string()).collect(),
        }
    }

    pub fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = panic.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        Self::new("Panic", message)
    }
}

impl From<&ConveyorError> for JobFailure {
    fn from(err: &ConveyorError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

pub type JobResult = Result<(), JobFailure>;

/// 失败任务的最终去向
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Disposition {
    /// 已移入重试集合
    Retried { retry_count: u32, at: f64 },
    /// 重试耗尽，已移入死信集合
    Dead,
    /// 不重试且不进死信集合，已删除
    Discarded,
    /// 暂存列表中已找不到该任务（通常是被回收器放回了队列）
    Vanished,
    /// 存储写入失败，暂存列表未处理
    Unresolved,
}

/// 任务执行上下文，在中间件之间传递
#[derive(Debug)]
pub struct JobContext {
    /// 解析后的任务记录，中间件可以修改
    pub job: JobRecord,
    pub queue: String,
    pub identity: String,
    /// 暂存列表中的原始负载
    pub raw: String,
    pub failure: Option<JobFailure>,
    pub disposition: Option<Disposition>,
}

impl JobContext {
    pub fn new(
        job: JobRecord,
        queue: impl Into<String>,
        identity: impl Into<String>,
        raw: impl Into<String>,
    ) -> Self {
        Self {
            job,
            queue: queue.into(),
            identity: identity.into(),
            raw: raw.into(),
            failure: None,
            disposition: None,
        }
    }

    /// 重试步骤是否已经处理过暂存记录
    pub fn is_resolved(&self) -> bool {
        matches!(
            self.disposition,
            Some(Disposition::Retried { .. } | Disposition::Dead | Disposition::Discarded | Disposition::Vanished)
        )
    }
}

#[async_trait]
pub trait ServerMiddleware: Send + Sync {
    async fn call(&self, ctx: &mut JobContext, next: Next<'_>) -> JobResult;
}

/// 链中剩余的部分
pub struct Next<'a> {
    rest: &'a [Arc<dyn ServerMiddleware>],
    invoker: &'a HandlerInvoker,
}

impl Next<'_> {
    pub async fn run(self, ctx: &mut JobContext) -> JobResult {
        match self.rest.split_first() {
            Some((head, rest)) => {
                head.call(
                    ctx,
                    Next {
                        rest,
                        invoker: self.invoker,
                    },
                )
                .await
            }
            None => self.invoker.invoke(ctx).await,
        }
    }
}

/// 链的末端：按任务类型查找处理器并执行
///
/// 类型未注册与处理器 panic 都按普通失败处理。
pub struct HandlerInvoker {
    registry: Arc<HandlerRegistry>,
}

impl HandlerInvoker {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub async fn invoke(&self, ctx: &mut JobContext) -> JobResult {
        let handler = self
            .registry
            .resolve(&ctx.job.class)
            .map_err(|e| JobFailure::from(&e))?;

        match AssertUnwindSafe(handler.perform(&ctx.job.args))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(JobFailure::from_error(&err)),
            Err(panic) => Err(JobFailure::from_panic(panic)),
        }
    }
}

/// 配置完成后不可变的中间件链
pub struct Chain {
    middleware: Vec<Arc<dyn ServerMiddleware>>,
    retry: Arc<RetryMiddleware>,
    invoker: HandlerInvoker,
}

impl Chain {
    /// 用户中间件在外，内置的失败日志与重试步骤在内
    pub fn new(
        user: Vec<Arc<dyn ServerMiddleware>>,
        retry: Arc<RetryMiddleware>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let mut middleware = user;
        middleware.push(Arc::new(FailureLogger));
        middleware.push(retry.clone());
        Self {
            middleware,
            retry,
            invoker: HandlerInvoker::new(registry),
        }
    }

    pub async fn invoke(&self, ctx: &mut JobContext) -> JobResult {
        Next {
            rest: &self.middleware,
            invoker: &self.invoker,
        }
        .run(ctx)
        .await
    }

    /// 内置的重试步骤，失败发生在它外层时由处理器直接调用
    pub fn retry(&self) -> &RetryMiddleware {
        &self.retry
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use conveyor_core::config::{DeadSetConfig, RetryConfig};
    use conveyor_infrastructure::InMemoryStore;

    struct Record {
        name: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ServerMiddleware for Record {
        async fn call(&self, ctx: &mut JobContext, next: Next<'_>) -> JobResult {
            self.calls.lock().unwrap().push(format!("{}:before", self.name));
            ctx.job.extra.insert(self.name.to_string(), serde_json::json!(true));
            let result = next.run(ctx).await;
            self.calls.lock().unwrap().push(format!("{}:after", self.name));
            result
        }
    }

    fn chain(calls: Arc<Mutex<Vec<String>>>) -> Chain {
        let store = Arc::new(InMemoryStore::new());
        let retry = Arc::new(RetryMiddleware::new(
            store,
            RetryConfig::default(),
            DeadSetConfig::default(),
        ));
        let mut registry = HandlerRegistry::new();
        let seen = calls.clone();
        registry.register_fn("Work", move |_| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push("handler".to_string());
                Ok::<(), anyhow::Error>(())
            }
        });
        let user: Vec<Arc<dyn ServerMiddleware>> = vec![
            Arc::new(Record {
                name: "outer",
                calls: calls.clone(),
            }),
            Arc::new(Record {
                name: "inner",
                calls,
            }),
        ];
        Chain::new(user, retry, Arc::new(registry))
    }

    #[tokio::test]
    async fn middleware_runs_outermost_first() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let chain = chain(calls.clone());
        assert_eq!(chain.len(), 4);

        let mut ctx = JobContext::new(JobRecord::new("Work", vec![]), "default", "p1", "{}");
        chain.invoke(&mut ctx).await.unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec!["outer:before", "inner:before", "handler", "inner:after", "outer:after"]
        );
        assert!(ctx.job.extra.contains_key("outer"));
        assert!(ctx.failure.is_none());
        assert!(!ctx.is_resolved());
    }

    #[tokio::test]
    async fn unknown_class_fails_in_invoker() {
        let chain = chain(Arc::new(Mutex::new(Vec::new())));
        let mut ctx = JobContext::new(JobRecord::new("Nope", vec![]), "default", "p1", "{}");
        let failure = chain.invoke(&mut ctx).await.unwrap_err();
        assert_eq!(failure.class, "UnknownJobClass");
        // 暂存列表里没有这条记录
        assert_eq!(ctx.disposition, Some(Disposition::Vanished));
    }

    #[test]
    fn failure_classes() {
        let typed = anyhow::Error::new(JobError::new("Timeout", "upstream timed out"));
        assert_eq!(JobFailure::from_error(&typed).class, "Timeout");

        let plain = anyhow::anyhow!("low level").context("while sending");
        let failure = JobFailure::from_error(&plain);
        assert_eq!(failure.class, "JobError");
        assert_eq!(failure.backtrace, vec!["while sending", "low level"]);

        let panic = JobFailure::from_panic(Box::new("kaboom"));
        assert_eq!(panic.class, "Panic");
        assert_eq!(panic.message, "kaboom");
    }
}
