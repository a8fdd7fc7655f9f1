use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::routes::AppState;

/// 存储可达时返回 healthy
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let store = match state.inspector.overview().await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };

    Json(json!({
        "status": store,
        "timestamp": chrono::Utc::now(),
        "service": "conveyor-api",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
