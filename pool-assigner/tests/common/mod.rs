use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common_redis::MockRedisClient;
use pool_assigner::controller::{AssignmentController, ControllerConfig};
use pool_assigner::lease::LeaseStore;
use pool_assigner::registry::InstanceRegistry;
use pool_assigner::types::PoolType;

pub const A: &str = "http://worker-a:8001";
pub const B: &str = "http://worker-b:8002";

/// One shared store and registry that several replicas can race against.
pub struct Cluster {
    pub store: MockRedisClient,
    pub registry: Arc<InstanceRegistry>,
    pub leases: LeaseStore,
}

impl Cluster {
    pub fn with_healthy(urls: &[&str]) -> Self {
        let store = MockRedisClient::new();
        let registry = Arc::new(InstanceRegistry::new([(
            PoolType::Simple,
            urls.iter().map(|url| url.to_string()).collect(),
        )]));
        for url in urls {
            registry.mark_health(url, true, Utc::now());
        }
        let leases = LeaseStore::new(Arc::new(store.clone()), "worker-lease");

        Self {
            store,
            registry,
            leases,
        }
    }

    pub fn replica(&self, holder_id: &str) -> Arc<AssignmentController> {
        Arc::new(AssignmentController::new(
            self.registry.clone(),
            self.leases.clone(),
            ControllerConfig {
                holder_id: holder_id.to_string(),
                identity_hint: None,
                lease_ttl: Duration::from_secs(30),
                heartbeat_interval: Duration::from_secs(10),
                reconcile_interval: Duration::from_secs(30),
            },
        ))
    }

    pub async fn holder_of(&self, url: &str) -> Option<String> {
        self.leases
            .read(PoolType::Simple, url)
            .await
            .unwrap()
            .map(|lease| lease.holder_id)
    }
}

pub fn assigned_url(controller: &AssignmentController) -> Option<String> {
    controller
        .get_assigned_instance(PoolType::Simple)
        .ok()
        .map(|instance| instance.url)
}
