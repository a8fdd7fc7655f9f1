//! # conveyor-infrastructure
//!
//! 共享队列存储的实现（Redis 与内存）以及指标上报。

pub mod in_memory_store;
pub mod observability;
pub mod redis_store;

pub use in_memory_store::InMemoryStore;
pub use observability::{init_prometheus_exporter, MetricsCollector};
pub use redis_store::RedisStore;
