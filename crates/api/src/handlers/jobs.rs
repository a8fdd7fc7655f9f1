use axum::{extract::State, response::IntoResponse, Json};
use conveyor_core::JobRequest;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::response::created;
use crate::routes::AppState;

/// 单个任务或一批任务
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PushRequest {
    Bulk { jobs: Vec<JobRequest> },
    Single(JobRequest),
}

#[derive(Debug, Serialize)]
pub struct PushResponse {
    pub jids: Vec<String>,
}

pub async fn push_jobs(
    State(state): State<AppState>,
    Json(request): Json<PushRequest>,
) -> ApiResult<impl IntoResponse> {
    let requests = match request {
        PushRequest::Single(job) => vec![job],
        PushRequest::Bulk { jobs } if jobs.is_empty() => {
            return Err(ApiError::BadRequest("jobs 不能为空".to_string()));
        }
        PushRequest::Bulk { jobs } => jobs,
    };

    let jids = state.client.push_bulk(requests).await?;
    info!("通过API提交 {} 个任务", jids.len());
    Ok(created(PushResponse { jids }))
}
