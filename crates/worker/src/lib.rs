//! # conveyor-worker
//!
//! 工作进程：可靠取任务、中间件链、重试管理、执行池、心跳与启动器。

pub mod components;
pub mod fetcher;
pub mod middleware;
pub mod stats;

pub use components::{HeartbeatManager, Launcher, LifecycleEvent, Processor, ProcessorState};
pub use fetcher::{Fetcher, QueueOrder, UnitOfWork};
pub use middleware::{
    Chain, Disposition, FailureLogger, JobContext, JobFailure, JobResult, Next, RetryMiddleware,
    ServerMiddleware,
};
pub use stats::ProcessStats;
