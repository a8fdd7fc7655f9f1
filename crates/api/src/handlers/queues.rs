use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use conveyor_core::JobLocation;
use serde_json::json;

use super::PageQuery;
use crate::error::{ApiError, ApiResult};
use crate::response::{success, PaginatedResponse};
use crate::routes::AppState;

pub async fn list_queues(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let queues = state.inspector.queues().await?;
    Ok(success(queues))
}

/// 最新入队的任务在前
pub async fn list_queue_jobs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult<impl IntoResponse> {
    let (page, per_page) = query.resolve()?;
    let total = state
        .inspector
        .queues()
        .await?
        .into_iter()
        .find(|q| q.name == name)
        .map(|q| q.size)
        .unwrap_or(0);
    let items = state.inspector.queue_jobs(&name, page, per_page).await?;
    Ok(success(PaginatedResponse::new(items, total, page, per_page)))
}

pub async fn clear_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let removed = state.inspector.clear_queue(&name).await?;
    Ok(success(json!({ "queue": name, "removed": removed })))
}

pub async fn delete_queue_job(
    State(state): State<AppState>,
    Path((name, jid)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let location = JobLocation::Queue(name);
    if !state.inspector.delete_job(&location, &jid).await? {
        return Err(ApiError::NotFound);
    }
    Ok(success(json!({ "jid": jid, "deleted": true })))
}
