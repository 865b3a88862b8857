use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::types::{InstanceHealth, PoolType, WorkerInstance};

struct RegisteredInstance {
    pool_type: PoolType,
    url: String,
    identity_hint: Option<u16>,
    health: RwLock<InstanceHealth>,
}

impl RegisteredInstance {
    fn health(&self) -> InstanceHealth {
        match self.health.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn snapshot(&self) -> WorkerInstance {
        WorkerInstance {
            pool_type: self.pool_type,
            url: self.url.clone(),
            identity_hint: self.identity_hint,
            health: self.health(),
        }
    }
}

/// The fixed set of worker instances per pool type, in configuration order.
///
/// The set never changes after construction. Only the health pair of each
/// instance mutates, and only through [`InstanceRegistry::mark_health`].
pub struct InstanceRegistry {
    pools: BTreeMap<PoolType, Vec<RegisteredInstance>>,
}

impl InstanceRegistry {
    /// Every instance starts out unhealthy and unchecked.
    pub fn new<I>(pools: I) -> Self
    where
        I: IntoIterator<Item = (PoolType, Vec<String>)>,
    {
        let pools = pools
            .into_iter()
            .map(|(pool_type, urls)| {
                let instances = urls
                    .into_iter()
                    .map(|url| RegisteredInstance {
                        pool_type,
                        identity_hint: identity_hint(&url),
                        url,
                        health: RwLock::new(InstanceHealth::default()),
                    })
                    .collect();
                (pool_type, instances)
            })
            .collect();

        Self { pools }
    }

    pub fn list(&self, pool_type: PoolType) -> Vec<WorkerInstance> {
        self.pools
            .get(&pool_type)
            .map(|instances| instances.iter().map(RegisteredInstance::snapshot).collect())
            .unwrap_or_default()
    }

    pub fn healthy_of(&self, pool_type: PoolType) -> Vec<WorkerInstance> {
        self.list(pool_type)
            .into_iter()
            .filter(WorkerInstance::is_healthy)
            .collect()
    }

    /// Every registered instance across all pool types.
    pub fn all(&self) -> Vec<WorkerInstance> {
        self.pools
            .values()
            .flatten()
            .map(RegisteredInstance::snapshot)
            .collect()
    }

    pub fn is_healthy(&self, url: &str) -> bool {
        self.pools
            .values()
            .flatten()
            .find(|instance| instance.url == url)
            .is_some_and(|instance| instance.health().is_healthy)
    }

    /// Replace the health pair of every instance registered under `url`.
    ///
    /// Returns the previous `is_healthy` flag, or `None` if the url is unknown.
    pub fn mark_health(
        &self,
        url: &str,
        is_healthy: bool,
        checked_at: DateTime<Utc>,
    ) -> Option<bool> {
        let mut previous = None;

        for instance in self.pools.values().flatten().filter(|i| i.url == url) {
            let mut guard = match instance.health.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            previous = Some(guard.is_healthy);
            *guard = InstanceHealth {
                is_healthy,
                last_checked_at: Some(checked_at),
            };
        }

        previous
    }
}

/// The explicit port of an instance url, used as its identity hint.
fn identity_hint(url: &str) -> Option<u16> {
    url::Url::parse(url).ok().and_then(|parsed| parsed.port())
}
