use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use conveyor_core::{JobLocation, SortedSet};
use serde_json::json;

use super::PageQuery;
use crate::error::{ApiError, ApiResult};
use crate::response::{success, PaginatedResponse};
use crate::routes::AppState;

fn parse_set(name: &str) -> Result<SortedSet, ApiError> {
    name.parse::<SortedSet>()
        .map_err(|_| ApiError::BadRequest(format!("未知的集合: {name}，可选 schedule、retry、dead")))
}

/// 按分数（执行时间）升序
pub async fn list_set_jobs(
    State(state): State<AppState>,
    Path(set): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult<impl IntoResponse> {
    let set = parse_set(&set)?;
    let (page, per_page) = query.resolve()?;
    let total = state.inspector.set_size(set).await?;
    let items = state.inspector.set_jobs(set, page, per_page).await?;
    Ok(success(PaginatedResponse::new(items, total, page, per_page)))
}

pub async fn clear_set(
    State(state): State<AppState>,
    Path(set): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let set = parse_set(&set)?;
    let removed = state.inspector.clear_set(set).await?;
    Ok(success(json!({ "set": set, "removed": removed })))
}

pub async fn delete_set_job(
    State(state): State<AppState>,
    Path((set, jid)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let location = JobLocation::Set(parse_set(&set)?);
    if !state.inspector.delete_job(&location, &jid).await? {
        return Err(ApiError::NotFound);
    }
    Ok(success(json!({ "jid": jid, "deleted": true })))
}

/// 立即放回原队列
pub async fn retry_set_job(
    State(state): State<AppState>,
    Path((set, jid)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let set = parse_set(&set)?;
    let moved = state.inspector.retry_now(set, &jid).await?;
    if !moved {
        // 查找与移动之间被其他进程取走
        return Err(ApiError::NotFound);
    }
    Ok(success(json!({ "jid": jid, "enqueued": true })))
}
