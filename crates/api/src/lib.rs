//! # conveyor-api
//!
//! 运行状态查询与管理的HTTP接口，基于 [`conveyor_core::Inspector`] 和
//! [`conveyor_core::Client`]。

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use std::future::Future;

use tokio::net::TcpListener;
use tracing::info;

use conveyor_core::{ConveyorError, ConveyorResult};

pub use error::{ApiError, ApiResult};
pub use response::{ApiResponse, PaginatedResponse};
pub use routes::{create_routes, AppState};

/// 启动HTTP服务，`shutdown` 完成后优雅退出
pub async fn serve<F>(bind_address: &str, state: AppState, shutdown: F) -> ConveyorResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind_address).await.map_err(|e| {
        ConveyorError::Configuration(format!("无法绑定API地址 {bind_address}: {e}"))
    })?;
    info!("API服务监听于 {}", bind_address);

    axum::serve(listener, create_routes(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ConveyorError::Internal(format!("API服务异常退出: {e}")))
}
