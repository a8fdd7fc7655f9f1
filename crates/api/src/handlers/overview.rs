use axum::{extract::State, response::IntoResponse};
use tracing::debug;

use crate::error::ApiResult;
use crate::response::success;
use crate::routes::AppState;

pub async fn get_overview(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    debug!("获取全局概览");
    let overview = state.inspector.overview().await?;
    Ok(success(overview))
}
