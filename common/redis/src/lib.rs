use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use redis::ErrorKind as RedisErrorKind;

#[derive(Error, Debug, Clone)]
pub enum CustomRedisError {
    #[error("Not found in redis")]
    NotFound,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Timeout error")]
    Timeout,
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CustomRedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CustomRedisError::Timeout
        } else {
            CustomRedisError::Redis(Arc::new(err))
        }
    }
}

impl From<std::string::FromUtf8Error> for CustomRedisError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        CustomRedisError::ParseError(err.to_string())
    }
}

impl CustomRedisError {
    /// Create a Redis error from an ErrorKind (primarily for testing)
    pub fn from_redis_kind(kind: redis::ErrorKind, description: &'static str) -> Self {
        CustomRedisError::Redis(Arc::new(redis::RedisError::from((kind, description))))
    }

    /// Determine if this error is unrecoverable and should not be retried
    ///
    /// Returns `true` for configuration errors and permanent failures.
    /// Returns `false` for transient network/connection issues that may resolve on retry.
    pub fn is_unrecoverable_error(&self) -> bool {
        match self {
            CustomRedisError::Timeout => false,
            CustomRedisError::InvalidConfiguration(_) => true,
            CustomRedisError::ParseError(_) => true,
            // NotFound is permanent - caller should handle this
            CustomRedisError::NotFound => true,
            CustomRedisError::Redis(err) => {
                matches!(
                    err.kind(),
                    redis::ErrorKind::InvalidClientConfig | redis::ErrorKind::AuthenticationFailed
                ) || err.is_unrecoverable_error()
            }
        }
    }
}

/// The subset of key-value operations lease coordination is built on.
///
/// Any store offering atomic "create if absent, with expiry" can implement
/// this; [`RedisClient`] maps each call onto a single Redis command.
#[async_trait]
pub trait Client {
    /// Returns `CustomRedisError::NotFound` when the key is absent or expired.
    async fn get(&self, k: String) -> Result<String, CustomRedisError>;

    /// `SET k v EX seconds NX`. Returns whether this call created the key.
    async fn set_nx_ex(&self, k: String, v: String, seconds: u64)
        -> Result<bool, CustomRedisError>;

    /// `SET k v EX seconds XX`. Returns whether the key existed and was overwritten.
    async fn set_xx_ex(&self, k: String, v: String, seconds: u64)
        -> Result<bool, CustomRedisError>;

    /// Deleting an absent key is not an error.
    async fn del(&self, k: String) -> Result<(), CustomRedisError>;

    /// Every key matching a glob-style `pattern`, following the SCAN cursor to completion.
    async fn scan_match(&self, pattern: String) -> Result<Vec<String>, CustomRedisError>;
}

mod client;
mod mock;

pub use client::RedisClient;
pub use mock::{MockRedisCall, MockRedisClient, MockRedisValue};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_recoverable() {
        let err = CustomRedisError::Timeout;
        assert!(!err.is_unrecoverable_error());
    }

    #[test]
    fn test_parse_error_is_unrecoverable() {
        let err = CustomRedisError::ParseError("invalid data".to_string());
        assert!(err.is_unrecoverable_error());
    }

    #[test]
    fn test_invalid_configuration_is_unrecoverable() {
        let err = CustomRedisError::InvalidConfiguration("test config error".to_string());
        assert!(err.is_unrecoverable_error());
    }

    #[test]
    fn test_io_error_is_recoverable() {
        let err = CustomRedisError::from_redis_kind(RedisErrorKind::IoError, "Connection refused");
        assert!(
            !err.is_unrecoverable_error(),
            "IoError should be recoverable"
        );
    }

    #[test]
    fn test_authentication_failed_is_unrecoverable() {
        let err = CustomRedisError::from_redis_kind(
            RedisErrorKind::AuthenticationFailed,
            "WRONGPASS invalid username-password pair",
        );
        assert!(
            err.is_unrecoverable_error(),
            "AuthenticationFailed should be unrecoverable"
        );
    }
}
