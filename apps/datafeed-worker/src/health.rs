//! Liveness/readiness/metrics surface, the same shape the teacher's
//! worker apps expose: `/health`, `/healthz` for liveness probes,
//! `/ready`, `/readyz` for readiness, `/metrics` for Prometheus scrape.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct HealthState {
    inner: Arc<HealthStateInner>,
}

struct HealthStateInner {
    app_name: &'static str,
    app_version: &'static str,
    prometheus: PrometheusHandle,
}

impl HealthState {
    pub fn new(app_name: &'static str, app_version: &'static str, prometheus: PrometheusHandle) -> Self {
        Self {
            inner: Arc::new(HealthStateInner {
                app_name,
                app_version,
                prometheus,
            }),
        }
    }
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    name: &'static str,
    version: &'static str,
}

async fn health(State(state): State<HealthState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        name: state.inner.app_name,
        version: state.inner.app_version,
    })
}

async fn metrics(State(state): State<HealthState>) -> String {
    state.inner.prometheus.render()
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/ready", get(health))
        .route("/readyz", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}
