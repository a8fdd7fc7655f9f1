use axum::{
    routing::{delete, get, post},
    Router,
};
use conveyor_core::{Client, Inspector};

use crate::handlers::{health, jobs, overview, processes, queues, sets};
use crate::middleware::{cors_layer, request_logging, trace_layer};

#[derive(Clone)]
pub struct AppState {
    pub inspector: Inspector,
    pub client: Client,
}

impl AppState {
    pub fn new(inspector: Inspector, client: Client) -> Self {
        Self { inspector, client }
    }
}

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/overview", get(overview::get_overview))
        .route("/api/jobs", post(jobs::push_jobs))
        .route("/api/queues", get(queues::list_queues))
        .route(
            "/api/queues/{name}",
            get(queues::list_queue_jobs).delete(queues::clear_queue),
        )
        .route("/api/queues/{name}/jobs/{jid}", delete(queues::delete_queue_job))
        .route(
            "/api/sets/{set}",
            get(sets::list_set_jobs).delete(sets::clear_set),
        )
        .route("/api/sets/{set}/jobs/{jid}", delete(sets::delete_set_job))
        .route("/api/sets/{set}/jobs/{jid}/retry", post(sets::retry_set_job))
        .route("/api/processes", get(processes::list_processes))
        .route("/api/processes/{identity}/quiet", post(processes::quiet_process))
        .route("/api/processes/{identity}/stop", post(processes::stop_process))
        .layer(axum::middleware::from_fn(request_logging))
        .layer(trace_layer())
        .layer(cors_layer())
        .with_state(state)
}
