use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use conveyor_core::ConveyorError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("任务引擎错误: {0}")]
    Conveyor(#[from] ConveyorError),

    #[error("未找到资源")]
    NotFound,

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("内部服务器错误: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message, error_type, suggestions) = match &self {
            ApiError::Conveyor(ConveyorError::JobNotFound { jid }) => (
                StatusCode::NOT_FOUND,
                format!("任务 {jid} 不存在"),
                "JOB_NOT_FOUND".to_string(),
                vec![
                    "任务可能已被执行、删除或移动到其他集合".to_string(),
                    "使用 GET /api/queues 或 GET /api/sets/{set} 查看任务".to_string(),
                ],
            ),
            ApiError::Conveyor(
                ConveyorError::InvalidJob(msg) | ConveyorError::MalformedJob(msg),
            ) => (
                StatusCode::BAD_REQUEST,
                format!("任务参数无效: {msg}"),
                "INVALID_JOB".to_string(),
                vec![
                    "class 不能为空，队列名不能包含 ':'".to_string(),
                    "分页参数 page 与 per_page 必须大于0".to_string(),
                ],
            ),
            ApiError::Conveyor(err) if err.is_transient() => (
                StatusCode::SERVICE_UNAVAILABLE,
                "共享存储暂时不可用".to_string(),
                "STORE_UNAVAILABLE".to_string(),
                vec![
                    "请稍后重试".to_string(),
                    "查看 GET /health 检查系统状态".to_string(),
                ],
            ),
            ApiError::Conveyor(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "系统内部错误".to_string(),
                "INTERNAL_ERROR".to_string(),
                vec![format!("错误详情: {err}")],
            ),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                "请求的资源不存在".to_string(),
                "NOT_FOUND".to_string(),
                vec!["请检查请求URL是否正确".to_string()],
            ),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                format!("请求参数错误: {msg}"),
                "BAD_REQUEST".to_string(),
                vec!["请检查请求格式和参数".to_string()],
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "系统内部错误".to_string(),
                "INTERNAL_ERROR".to_string(),
                vec![format!("错误详情: {msg}")],
            ),
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "type": error_type,
                "code": status.as_u16(),
                "suggestions": suggestions,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
