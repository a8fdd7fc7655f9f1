//! # 数据模型
//!
//! 任务记录与进程注册表条目，均以JSON形式存放在共享存储中。
//!
//! ## 核心模型
//!
//! ### JobRecord - 任务记录
//! 由客户端创建，在队列、定时集合、重试集合、死信集合和进程暂存列表之间流转，
//! 任何时刻只存在于其中一个位置。
//!
//! ### ProcessInfo / ProcessSnapshot - 进程注册表
//! 每个工作进程启动时写入，心跳刷新，超过TTL未刷新即视为进程已死。
//!
//! ## 使用示例
//!
//! ```rust
//! use conveyor_core::models::{JobRecord, RetryPolicy};
//! use serde_json::json;
//!
//! let job = JobRecord::new("HardWorker", vec![json!("bob"), json!(5)])
//!     .with_queue("critical")
//!     .with_retry(RetryPolicy::Limit(3));
//! assert_eq!(job.retry_count(), 0);
//! ```

pub mod job;
pub mod process;

pub use job::*;
pub use process::*;
