use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::controller::AssignmentController;
use crate::error::LeaseError;
use crate::lease::LeaseStore;
use crate::registry::InstanceRegistry;
use crate::types::PoolType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub url: String,
    pub is_healthy: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Some holder, possibly this process, has a live lease on the instance.
    pub is_leased: bool,
    pub is_leased_by_me: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolTypeStatus {
    pub instances: Vec<InstanceStatus>,
    #[serde(rename = "assignedURL")]
    pub assigned_url: Option<String>,
    pub healthy_count: usize,
    pub leased_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PoolStatus(pub BTreeMap<PoolType, PoolTypeStatus>);

/// Diagnostic snapshot of every pool. Has no effect on assignment state.
pub struct PoolStatusReporter {
    registry: Arc<InstanceRegistry>,
    leases: LeaseStore,
    controller: Arc<AssignmentController>,
}

impl PoolStatusReporter {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        leases: LeaseStore,
        controller: Arc<AssignmentController>,
    ) -> Self {
        Self {
            registry,
            leases,
            controller,
        }
    }

    pub async fn pool_status(&self) -> Result<PoolStatus, LeaseError> {
        let mut pools = BTreeMap::new();

        for pool_type in PoolType::ALL {
            let leased = self.leases.leased_urls(pool_type).await?;
            let state = self.controller.state(pool_type);
            let mine = self.held_by_me(pool_type, state.leased_url(), &leased).await?;

            let instances: Vec<InstanceStatus> = self
                .registry
                .list(pool_type)
                .into_iter()
                .map(|instance| {
                    let is_leased = leased.contains(&instance.url);
                    InstanceStatus {
                        is_leased,
                        is_leased_by_me: mine.as_deref() == Some(instance.url.as_str()),
                        is_healthy: instance.health.is_healthy,
                        last_checked_at: instance.health.last_checked_at,
                        url: instance.url,
                    }
                })
                .collect();

            pools.insert(
                pool_type,
                PoolTypeStatus {
                    healthy_count: instances.iter().filter(|i| i.is_healthy).count(),
                    leased_count: instances.iter().filter(|i| i.is_leased).count(),
                    assigned_url: state.instance().map(|instance| instance.url.clone()),
                    instances,
                },
            );
        }

        Ok(PoolStatus(pools))
    }

    /// The url this process holds according to the stored record, which can
    /// lag behind the controller's view until the next reconcile.
    async fn held_by_me(
        &self,
        pool_type: PoolType,
        assigned: Option<&str>,
        leased: &HashSet<String>,
    ) -> Result<Option<String>, LeaseError> {
        let Some(url) = assigned.filter(|url| leased.contains(*url)) else {
            return Ok(None);
        };

        match self.leases.read(pool_type, url).await {
            Ok(Some(lease)) if lease.holder_id == self.controller.holder_id() => {
                Ok(Some(url.to_owned()))
            }
            Ok(_) | Err(LeaseError::Malformed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerConfig;
    use assert_json_diff::assert_json_eq;
    use common_redis::MockRedisClient;
    use serde_json::json;
    use std::time::Duration;

    const A: &str = "http://worker-a:8001";
    const B: &str = "http://worker-b:8002";

    #[tokio::test]
    async fn test_pool_status_combines_health_and_leases() {
        let store = MockRedisClient::new();
        let registry = Arc::new(InstanceRegistry::new([(
            PoolType::Simple,
            vec![A.to_string(), B.to_string()],
        )]));
        let checked_at = "2026-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        registry.mark_health(A, true, checked_at);
        registry.mark_health(B, true, checked_at);
        let leases = LeaseStore::new(Arc::new(store.clone()), "test");
        let controller = Arc::new(AssignmentController::new(
            registry.clone(),
            leases.clone(),
            ControllerConfig {
                holder_id: "me".to_string(),
                ..ControllerConfig::default()
            },
        ));
        controller.acquire(PoolType::Simple).await;
        leases
            .try_acquire(PoolType::Simple, B, "someone-else", Duration::from_secs(30))
            .await
            .unwrap();

        let reporter = PoolStatusReporter::new(registry, leases, controller);
        let status = reporter.pool_status().await.unwrap();

        assert_json_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({
                "simple": {
                    "instances": [
                        {
                            "url": A,
                            "isHealthy": true,
                            "lastCheckedAt": "2026-01-01T00:00:00Z",
                            "isLeased": true,
                            "isLeasedByMe": true
                        },
                        {
                            "url": B,
                            "isHealthy": true,
                            "lastCheckedAt": "2026-01-01T00:00:00Z",
                            "isLeased": true,
                            "isLeasedByMe": false
                        }
                    ],
                    "assignedURL": A,
                    "healthyCount": 2,
                    "leasedCount": 2
                },
                "hierarchical": {
                    "instances": [],
                    "assignedURL": null,
                    "healthyCount": 0,
                    "leasedCount": 0
                }
            })
        );
    }

    #[tokio::test]
    async fn test_taken_over_lease_is_not_reported_as_mine() {
        let store = MockRedisClient::new();
        let registry = Arc::new(InstanceRegistry::new([(PoolType::Simple, vec![A.to_string()])]));
        registry.mark_health(A, true, Utc::now());
        let leases = LeaseStore::new(Arc::new(store.clone()), "test");
        let controller = Arc::new(AssignmentController::new(
            registry.clone(),
            leases.clone(),
            ControllerConfig {
                holder_id: "me".to_string(),
                ..ControllerConfig::default()
            },
        ));
        controller.acquire(PoolType::Simple).await;

        // Another replica took the lease before our next reconcile noticed
        leases.release(PoolType::Simple, A).await.unwrap();
        leases
            .try_acquire(PoolType::Simple, A, "someone-else", Duration::from_secs(30))
            .await
            .unwrap();

        let reporter = PoolStatusReporter::new(registry, leases, controller);
        let status = reporter.pool_status().await.unwrap();
        let simple = &status.0[&PoolType::Simple];

        assert_eq!(simple.assigned_url.as_deref(), Some(A));
        assert!(simple.instances[0].is_leased);
        assert!(!simple.instances[0].is_leased_by_me);
    }

    #[tokio::test]
    async fn test_pool_status_fails_when_store_is_down() {
        let store = MockRedisClient::new();
        let registry = Arc::new(InstanceRegistry::new([(PoolType::Simple, Vec::new())]));
        let leases = LeaseStore::new(Arc::new(store.clone()), "test");
        let controller = Arc::new(AssignmentController::new(
            registry.clone(),
            leases.clone(),
            ControllerConfig::default(),
        ));
        store.set_unavailable(true);

        let reporter = PoolStatusReporter::new(registry, leases, controller);

        assert!(matches!(
            reporter.pool_status().await,
            Err(LeaseError::StoreUnavailable(_))
        ));
    }
}
