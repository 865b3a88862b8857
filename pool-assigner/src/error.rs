use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common_redis::CustomRedisError;
use serde_json::json;
use thiserror::Error;

use crate::types::PoolType;

/// Errors from the lease store. Callers treat all of them as transient:
/// the current assignment is kept and the operation is retried next cycle.
#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("lease store unavailable: {0}")]
    StoreUnavailable(#[from] CustomRedisError),
    #[error("malformed lease record at {key}: {error}")]
    Malformed {
        key: String,
        error: serde_json::Error,
    },
}

/// The only error surfaced synchronously to consumers of the assignment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssignmentError {
    #[error("no {pool_type} instance is currently assigned to this process")]
    ServiceUnavailable { pool_type: PoolType },
}

impl IntoResponse for AssignmentError {
    fn into_response(self) -> Response {
        match self {
            AssignmentError::ServiceUnavailable { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown pool type: {0}")]
pub struct UnknownPoolType(pub String);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid instance url {url:?} for the {pool_type} pool: {error}")]
    InvalidInstanceUrl {
        pool_type: PoolType,
        url: String,
        error: url::ParseError,
    },
    #[error("lease ttl must be at least one second")]
    LeaseTtlTooShort,
    #[error("heartbeat interval ({heartbeat_ms}ms) must be shorter than the lease ttl ({ttl_ms}ms)")]
    HeartbeatNotShorterThanTtl { heartbeat_ms: u128, ttl_ms: u128 },
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

#[derive(Error, Debug)]
pub enum HealthCheckError {
    #[error("health probe request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("health probe returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("health probe reported status {0:?}")]
    NotHealthy(String),
}
