use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use std::time::Duration;
use tracing::debug;

use crate::{Client, CustomRedisError};

// Keys fetched per SCAN round trip
const SCAN_COUNT: usize = 100;

pub struct RedisClient {
    connection: MultiplexedConnection,
}

impl RedisClient {
    /// Create a new RedisClient with explicit timeouts
    ///
    /// # Arguments
    /// * `addr` - Redis connection string
    /// * `response_timeout` - Optional timeout for Redis command responses. `None` means no timeout.
    /// * `connection_timeout` - Optional timeout for establishing connections. `None` means no timeout.
    ///
    /// # Errors
    /// Returns `CustomRedisError::InvalidConfiguration` if `Some(Duration::ZERO)` is passed - use `None` for no timeout instead.
    pub async fn with_config(
        addr: String,
        response_timeout: Option<Duration>,
        connection_timeout: Option<Duration>,
    ) -> Result<RedisClient, CustomRedisError> {
        let client = redis::Client::open(addr)?;

        if let Some(timeout) = response_timeout {
            if timeout.is_zero() {
                return Err(CustomRedisError::InvalidConfiguration(
                    "Redis response timeout cannot be Duration::ZERO - use None for no timeout"
                        .to_string(),
                ));
            }
        }
        if let Some(timeout) = connection_timeout {
            if timeout.is_zero() {
                return Err(CustomRedisError::InvalidConfiguration(
                    "Redis connection timeout cannot be Duration::ZERO - use None for no timeout"
                        .to_string(),
                ));
            }
        }

        let mut config = redis::AsyncConnectionConfig::new();

        if let Some(timeout) = response_timeout {
            config = config.set_response_timeout(timeout);
        }

        if let Some(timeout) = connection_timeout {
            config = config.set_connection_timeout(timeout);
        }

        let connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        Ok(RedisClient { connection })
    }

    /// `SET k v EX seconds <condition>`, where condition is NX or XX.
    async fn set_conditional(
        &self,
        k: String,
        v: String,
        seconds: u64,
        condition: &'static str,
    ) -> Result<bool, CustomRedisError> {
        let mut conn = self.connection.clone();

        let result: Result<Option<String>, RedisError> = redis::cmd("SET")
            .arg(&k)
            .arg(&v)
            .arg("EX")
            .arg(seconds)
            .arg(condition)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(Some(_)) => Ok(true),
            // Condition not met: key existed for NX, or was missing for XX
            Ok(None) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        let mut conn = self.connection.clone();
        let raw_bytes: Option<Vec<u8>> = conn.get(k).await?;

        match raw_bytes {
            Some(bytes) if !bytes.is_empty() => Ok(String::from_utf8(bytes)?),
            _ => Err(CustomRedisError::NotFound),
        }
    }

    async fn set_nx_ex(
        &self,
        k: String,
        v: String,
        seconds: u64,
    ) -> Result<bool, CustomRedisError> {
        self.set_conditional(k, v, seconds, "NX").await
    }

    async fn set_xx_ex(
        &self,
        k: String,
        v: String,
        seconds: u64,
    ) -> Result<bool, CustomRedisError> {
        self.set_conditional(k, v, seconds, "XX").await
    }

    async fn del(&self, k: String) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(k).await?;
        Ok(())
    }

    async fn scan_match(&self, pattern: String) -> Result<Vec<String>, CustomRedisError> {
        let mut conn = self.connection.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        let mut round_trips = 0;

        loop {
            round_trips += 1;
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;

            keys.extend(batch);

            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once across iterations
        keys.sort();
        keys.dedup();
        debug!(%pattern, round_trips, keys = keys.len(), "scan complete");

        Ok(keys)
    }
}
