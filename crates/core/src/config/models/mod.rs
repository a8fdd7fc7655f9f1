pub mod api_observability;
pub mod app_config;
pub mod redis;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use api_observability::*;
pub use app_config::*;
pub use redis::*;
pub use retry::*;
pub use scheduler::*;
pub use worker::*;
