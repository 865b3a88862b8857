use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common_redis::{Client, CustomRedisError};
use serde::{Deserialize, Serialize};

use crate::error::LeaseError;
use crate::types::PoolType;

/// The record stored under `{namespace}:{pool_type}:{url}` for as long as a lease is live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub url: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Pool-scoped lease operations on top of the shared store.
///
/// Mutual exclusion between processes rests entirely on the store's
/// conditional create. Nothing here holds an in-process lock.
#[derive(Clone)]
pub struct LeaseStore {
    client: Arc<dyn Client + Send + Sync>,
    namespace: String,
}

impl LeaseStore {
    pub fn new(client: Arc<dyn Client + Send + Sync>, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_owned(),
        }
    }

    pub fn key(&self, pool_type: PoolType, url: &str) -> String {
        format!("{}{}", self.pool_prefix(pool_type), url)
    }

    pub fn pool_prefix(&self, pool_type: PoolType) -> String {
        format!("{}:{}:", self.namespace, pool_type)
    }

    /// Create the lease only if no live lease exists. Returns whether this call created it.
    pub async fn try_acquire(
        &self,
        pool_type: PoolType,
        url: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<bool, LeaseError> {
        let now = Utc::now();
        let lease = Lease {
            url: url.to_owned(),
            holder_id: holder_id.to_owned(),
            acquired_at: now,
            last_heartbeat_at: now,
        };
        let key = self.key(pool_type, url);
        let value = encode(&key, &lease)?;

        Ok(self.client.set_nx_ex(key, value, ttl_secs(ttl)).await?)
    }

    /// Refresh the heartbeat timestamp and ttl of a lease this holder still owns.
    ///
    /// Returns `false` without writing when the lease is gone or owned by
    /// someone else. The write itself only lands if the key still exists,
    /// so an expiry between the read and the write cannot resurrect the lease.
    pub async fn renew(
        &self,
        pool_type: PoolType,
        url: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<bool, LeaseError> {
        let Some(mut lease) = self.read(pool_type, url).await? else {
            return Ok(false);
        };
        if lease.holder_id != holder_id {
            return Ok(false);
        }

        lease.last_heartbeat_at = Utc::now();
        let key = self.key(pool_type, url);
        let value = encode(&key, &lease)?;

        Ok(self.client.set_xx_ex(key, value, ttl_secs(ttl)).await?)
    }

    pub async fn read(&self, pool_type: PoolType, url: &str) -> Result<Option<Lease>, LeaseError> {
        let key = self.key(pool_type, url);

        match self.client.get(key.clone()).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|error| LeaseError::Malformed { key, error }),
            Err(CustomRedisError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, pool_type: PoolType, url: &str) -> Result<bool, LeaseError> {
        match self.client.get(self.key(pool_type, url)).await {
            Ok(_) => Ok(true),
            Err(CustomRedisError::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Unconditionally delete the lease. Releasing an absent lease is not an error.
    pub async fn release(&self, pool_type: PoolType, url: &str) -> Result<(), LeaseError> {
        Ok(self.client.del(self.key(pool_type, url)).await?)
    }

    /// Delete the lease unless it is now recorded under another holder.
    ///
    /// Returns whether a delete was issued. An unreadable record is deleted.
    pub async fn release_held(
        &self,
        pool_type: PoolType,
        url: &str,
        holder_id: &str,
    ) -> Result<bool, LeaseError> {
        match self.read(pool_type, url).await {
            Ok(Some(lease)) if lease.holder_id != holder_id => Ok(false),
            Ok(_) | Err(LeaseError::Malformed { .. }) => {
                self.release(pool_type, url).await?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Every live key under `prefix`.
    pub async fn scan(&self, prefix: &str) -> Result<Vec<String>, LeaseError> {
        Ok(self.client.scan_match(format!("{prefix}*")).await?)
    }

    /// Urls of every instance of `pool_type` that some holder currently leases.
    pub async fn leased_urls(&self, pool_type: PoolType) -> Result<HashSet<String>, LeaseError> {
        let prefix = self.pool_prefix(pool_type);
        let keys = self.scan(&prefix).await?;

        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_owned))
            .collect())
    }
}

fn encode(key: &str, lease: &Lease) -> Result<String, LeaseError> {
    serde_json::to_string(lease).map_err(|error| LeaseError::Malformed {
        key: key.to_owned(),
        error,
    })
}

// The store expires keys at second granularity
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
