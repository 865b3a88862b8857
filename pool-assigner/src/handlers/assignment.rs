use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use super::app::AppState;
use crate::types::PoolType;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentResponse {
    pool_type: PoolType,
    url: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

pub async fn get_assignment(
    State(state): State<AppState>,
    Path(pool_type): Path<String>,
) -> Response {
    let pool_type = match pool_type.parse::<PoolType>() {
        Ok(pool_type) => pool_type,
        Err(e) => return error_response(StatusCode::NOT_FOUND, e),
    };

    match state.controller.get_assigned_instance(pool_type) {
        Ok(instance) => Json(AssignmentResponse {
            pool_type,
            url: instance.url,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn get_status(State(state): State<AppState>) -> Response {
    match state.reporter.pool_status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => {
            error!(error = %e, "failed to build pool status");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e)
        }
    }
}
