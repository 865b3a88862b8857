use std::sync::Arc;

use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;

use super::assignment;
use crate::controller::AssignmentController;
use crate::metrics;
use crate::status::PoolStatusReporter;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<AssignmentController>,
    pub reporter: Arc<PoolStatusReporter>,
}

pub fn app(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route("/_liveness", routing::get(ok))
        .route("/_readiness", routing::get(ok))
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .route("/status", routing::get(assignment::get_status))
        .route("/assignment/:pool_type", routing::get(assignment::get_assignment))
        .with_state(state)
        .layer(axum::middleware::from_fn(metrics::track_metrics))
}

pub async fn index() -> &'static str {
    "pool-assigner"
}

async fn ok() -> &'static str {
    "ok"
}
