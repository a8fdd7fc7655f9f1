//! # conveyor-core
//!
//! 后台任务引擎的核心类型：任务记录、配置、共享存储接口、处理器注册表、
//! 提交客户端与状态查询。

pub mod client;
pub mod config;
pub mod errors;
pub mod inspector;
pub mod keys;
pub mod logging;
pub mod models;
pub mod registry;
pub mod traits;

pub use client::{Client, JobRequest};
pub use config::AppConfig;
pub use errors::*;
pub use inspector::{Inspector, JobEntry, JobLocation, Overview, QueueSummary};
pub use keys::KeySpace;
pub use logging::init_logging;
pub use registry::{FnHandler, HandlerRegistry, JobHandler, NoopHandler};
pub use traits::{QueueStore, SortedSet, StoreStats};
