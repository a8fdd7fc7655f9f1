use axum::{
    extract::{Path, State},
    response::IntoResponse,
};
use serde_json::json;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::response::success;
use crate::routes::AppState;

pub async fn list_processes(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let processes = state.inspector.processes().await?;
    Ok(success(processes))
}

pub async fn quiet_process(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if !state.inspector.quiet_process(&identity).await? {
        return Err(ApiError::NotFound);
    }
    info!("通过API静默进程 {}", identity);
    Ok(success(json!({ "identity": identity, "signal": "TSTP" })))
}

pub async fn stop_process(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if !state.inspector.stop_process(&identity).await? {
        return Err(ApiError::NotFound);
    }
    info!("通过API停止进程 {}", identity);
    Ok(success(json!({ "identity": identity, "signal": "TERM" })))
}
