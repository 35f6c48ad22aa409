//! Minimal HTTP entry point for jobs. Upstream process-engine job polling
//! is a declared non-goal of this platform (some external system owns
//! deciding *when* a job is ready); this endpoint is the receiving side
//! of that contract so the router/worker-pool pipeline has a way in.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use dispatch_core::{Job, TenantRouter};
use std::sync::Arc;

#[derive(Clone)]
pub struct IngestState {
    router: Arc<TenantRouter>,
}

impl IngestState {
    pub fn new(router: Arc<TenantRouter>) -> Self {
        Self { router }
    }
}

async fn submit_job(State(state): State<IngestState>, Json(job): Json<Job>) -> StatusCode {
    let router = Arc::clone(&state.router);
    tokio::spawn(async move {
        router.route(job).await;
    });
    StatusCode::ACCEPTED
}

pub fn router(state: IngestState) -> Router {
    Router::new().route("/jobs", post(submit_job)).with_state(state)
}
