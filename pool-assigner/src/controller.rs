use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AssignmentError, LeaseError};
use crate::lease::LeaseStore;
use crate::registry::InstanceRegistry;
use crate::types::{AssignmentState, PoolType, Tenure, WorkerInstance};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Uniquely identifies this process as a lease holder.
    pub holder_id: String,
    /// Matched against instance identity hints when every lease is taken.
    pub identity_hint: Option<u16>,
    pub lease_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub reconcile_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            holder_id: "pool-assigner".to_string(),
            identity_hint: None,
            lease_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(30),
        }
    }
}

struct PoolSlot {
    /// Serializes acquire, heartbeat, reconcile and shutdown for this pool type.
    op_lock: Mutex<()>,
    /// Written only while `op_lock` is held, read without waiting.
    state: RwLock<AssignmentState>,
    store_failing: AtomicBool,
}

impl PoolSlot {
    fn new() -> Self {
        Self {
            op_lock: Mutex::new(()),
            state: RwLock::new(AssignmentState::Unassigned),
            store_failing: AtomicBool::new(false),
        }
    }

    fn state(&self) -> AssignmentState {
        match self.state.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_state(&self, state: AssignmentState) {
        match self.state.write() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }
}

/// Owns this process's assignment for every pool type and keeps it backed by a lease.
///
/// All cross-process exclusion comes from the lease store's conditional
/// create; the per-pool lock only keeps this process's own background paths
/// from interleaving.
pub struct AssignmentController {
    registry: Arc<InstanceRegistry>,
    leases: LeaseStore,
    config: ControllerConfig,
    pools: BTreeMap<PoolType, PoolSlot>,
}

impl AssignmentController {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        leases: LeaseStore,
        config: ControllerConfig,
    ) -> Self {
        let pools = PoolType::ALL
            .into_iter()
            .map(|pool_type| (pool_type, PoolSlot::new()))
            .collect();

        Self {
            registry,
            leases,
            config,
            pools,
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.config.holder_id
    }

    fn slot(&self, pool_type: PoolType) -> &PoolSlot {
        // Every pool type gets a slot in `new`
        &self.pools[&pool_type]
    }

    pub fn state(&self, pool_type: PoolType) -> AssignmentState {
        self.slot(pool_type).state()
    }

    /// The instance this process should use right now.
    ///
    /// Never blocks and never acquires; acquisition is the background loops' job.
    pub fn get_assigned_instance(
        &self,
        pool_type: PoolType,
    ) -> Result<WorkerInstance, AssignmentError> {
        match self.state(pool_type) {
            AssignmentState::Assigned { instance, .. } => Ok(instance),
            AssignmentState::Unassigned => Err(AssignmentError::ServiceUnavailable { pool_type }),
        }
    }

    /// Try to obtain an assignment for `pool_type`. A held lease is kept as is.
    pub async fn acquire(&self, pool_type: PoolType) -> AssignmentState {
        let slot = self.slot(pool_type);
        let _guard = slot.op_lock.lock().await;

        if slot.state().leased_url().is_none() {
            self.acquire_locked(pool_type, slot).await;
        }
        slot.state()
    }

    async fn acquire_locked(&self, pool_type: PoolType, slot: &PoolSlot) {
        let holder_id = &self.config.holder_id;

        for instance in self.registry.healthy_of(pool_type) {
            match self
                .leases
                .try_acquire(pool_type, &instance.url, holder_id, self.config.lease_ttl)
                .await
            {
                Ok(true) => {
                    self.store_recovered(pool_type, slot);
                    info!(%pool_type, url = %instance.url, %holder_id, "acquired instance lease");
                    metrics::counter!(
                        "pool_lease_acquired_total",
                        &[("pool_type", pool_type.to_string())]
                    )
                    .increment(1);
                    slot.set_state(AssignmentState::Assigned {
                        instance,
                        tenure: Tenure::Leased,
                    });
                    return;
                }
                Ok(false) => {
                    self.store_recovered(pool_type, slot);
                    debug!(%pool_type, url = %instance.url, "instance already leased");
                }
                Err(error) => {
                    // The remaining candidates would fail the same way
                    self.store_failed(pool_type, slot, "acquire", &error);
                    return;
                }
            }
        }

        self.adopt_fallback(pool_type, slot);
    }

    /// Every healthy instance is leased: adopt the healthy instance whose identity
    /// hint matches ours, without a lease. Nothing stops another process doing the same.
    fn adopt_fallback(&self, pool_type: PoolType, slot: &PoolSlot) {
        let fallback = self.config.identity_hint.and_then(|hint| {
            self.registry
                .list(pool_type)
                .into_iter()
                .find(|instance| instance.is_healthy() && instance.identity_hint == Some(hint))
        });

        match fallback {
            Some(instance) => {
                let already_adopted = slot
                    .state()
                    .instance()
                    .is_some_and(|current| current.url == instance.url);
                if !already_adopted {
                    warn!(
                        %pool_type,
                        url = %instance.url,
                        "no instance lease available, falling back to identity hint without a lease"
                    );
                    metrics::counter!(
                        "pool_fallback_assignments_total",
                        &[("pool_type", pool_type.to_string())]
                    )
                    .increment(1);
                }
                slot.set_state(AssignmentState::Assigned {
                    instance,
                    tenure: Tenure::Fallback,
                });
            }
            None => {
                if slot.state().is_assigned() {
                    warn!(%pool_type, "fallback instance no longer available, unassigned");
                } else {
                    warn!(%pool_type, "no instance available, remaining unassigned");
                }
                slot.set_state(AssignmentState::Unassigned);
            }
        }
    }

    /// Refresh the lease behind a leased assignment. A missing lease is left
    /// for reconciliation to act on.
    pub async fn heartbeat(&self, pool_type: PoolType) {
        let slot = self.slot(pool_type);
        let _guard = slot.op_lock.lock().await;

        let state = slot.state();
        let Some(url) = state.leased_url() else {
            return;
        };

        match self
            .leases
            .renew(pool_type, url, &self.config.holder_id, self.config.lease_ttl)
            .await
        {
            Ok(true) => {
                self.store_recovered(pool_type, slot);
                debug!(%pool_type, url, "renewed instance lease");
            }
            Ok(false) => {
                self.store_recovered(pool_type, slot);
                debug!(%pool_type, url, "instance lease missing on heartbeat");
            }
            Err(error) => {
                metrics::counter!(
                    "pool_heartbeat_failures_total",
                    &[("pool_type", pool_type.to_string())]
                )
                .increment(1);
                self.store_failed(pool_type, slot, "heartbeat", &error);
            }
        }
    }

    /// Re-validate the assignment against instance health and the lease store,
    /// correcting any drift.
    pub async fn reconcile(&self, pool_type: PoolType) {
        let slot = self.slot(pool_type);
        let _guard = slot.op_lock.lock().await;

        let (instance, tenure) = match slot.state() {
            AssignmentState::Unassigned => {
                self.acquire_locked(pool_type, slot).await;
                return;
            }
            AssignmentState::Assigned { instance, tenure } => (instance, tenure),
        };

        if !self.registry.is_healthy(&instance.url) {
            info!(%pool_type, url = %instance.url, "assigned instance is unhealthy, releasing");
            if tenure == Tenure::Leased {
                self.release_locked(pool_type, slot, &instance.url).await;
            }
            slot.set_state(AssignmentState::Unassigned);
            self.acquire_locked(pool_type, slot).await;
            return;
        }

        if tenure == Tenure::Fallback {
            // Try to upgrade to a real lease
            self.acquire_locked(pool_type, slot).await;
            return;
        }

        match self.leases.read(pool_type, &instance.url).await {
            Ok(Some(lease)) if lease.holder_id == self.config.holder_id => {
                self.store_recovered(pool_type, slot);
            }
            Ok(lease) => {
                self.store_recovered(pool_type, slot);
                let holder = lease.map(|lease| lease.holder_id);
                warn!(
                    %pool_type,
                    url = %instance.url,
                    current_holder = ?holder,
                    "instance lease expired or taken over, reassigning"
                );
                metrics::counter!("pool_lease_lost_total", &[("pool_type", pool_type.to_string())])
                    .increment(1);
                slot.set_state(AssignmentState::Unassigned);
                self.acquire_locked(pool_type, slot).await;
            }
            Err(error) => self.store_failed(pool_type, slot, "reconcile", &error),
        }
    }

    async fn release_locked(&self, pool_type: PoolType, slot: &PoolSlot, url: &str) {
        match self
            .leases
            .release_held(pool_type, url, &self.config.holder_id)
            .await
        {
            Ok(deleted) => {
                self.store_recovered(pool_type, slot);
                if deleted {
                    metrics::counter!(
                        "pool_lease_released_total",
                        &[("pool_type", pool_type.to_string())]
                    )
                    .increment(1);
                }
                info!(%pool_type, url, "released instance lease");
            }
            // The lease expires on its own once the ttl runs out
            Err(error) => self.store_failed(pool_type, slot, "release", &error),
        }
    }

    /// Release every held lease and return all pool types to unassigned.
    pub async fn shutdown(&self) {
        for (pool_type, slot) in &self.pools {
            let _guard = slot.op_lock.lock().await;

            let state = slot.state();
            if let Some(url) = state.leased_url() {
                self.release_locked(*pool_type, slot, url).await;
            }
            slot.set_state(AssignmentState::Unassigned);
        }
    }

    /// Acquire for every pool type, then heartbeat and reconcile on their
    /// intervals until `cancel` fires. Returns once the background loops have
    /// stopped and every held lease has been released.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        for pool_type in PoolType::ALL {
            self.acquire(pool_type).await;
        }

        let loops = cancel.child_token();
        let heartbeat = tokio::spawn({
            let controller = Arc::clone(&self);
            let token = loops.clone();
            async move {
                let period = controller.config.heartbeat_interval;
                controller
                    .run_periodic(period, token, |controller, pool_type| async move {
                        controller.heartbeat(pool_type).await
                    })
                    .await
            }
        });
        let reconcile = tokio::spawn({
            let controller = Arc::clone(&self);
            let token = loops.clone();
            async move {
                let period = controller.config.reconcile_interval;
                controller
                    .run_periodic(period, token, |controller, pool_type| async move {
                        controller.reconcile(pool_type).await
                    })
                    .await
            }
        });

        cancel.cancelled().await;
        loops.cancel();

        for (name, task) in [("heartbeat", heartbeat), ("reconcile", reconcile)] {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "assignment loop panicked");
            }
        }

        self.shutdown().await;
        info!(holder_id = %self.config.holder_id, "assignment controller stopped");
    }

    async fn run_periodic<F, Fut>(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
        step: F,
    ) where
        F: Fn(Arc<Self>, PoolType) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    for pool_type in PoolType::ALL {
                        step(Arc::clone(self), pool_type).await;
                    }
                }
            }
        }
    }

    // Store failures are logged once per transition, not once per call
    fn store_failed(&self, pool_type: PoolType, slot: &PoolSlot, op: &str, error: &LeaseError) {
        let unrecoverable = match error {
            LeaseError::StoreUnavailable(e) => e.is_unrecoverable_error(),
            LeaseError::Malformed { .. } => false,
        };

        if !slot.store_failing.swap(true, Ordering::SeqCst) {
            if unrecoverable {
                error!(
                    %pool_type,
                    op,
                    error = %error,
                    "lease store rejected the call and will not recover on retry"
                );
                return;
            }
            warn!(
                %pool_type,
                op,
                error = %error,
                "lease store call failed, keeping current assignment"
            );
        } else {
            debug!(%pool_type, op, error = %error, "lease store call failed");
        }
    }

    fn store_recovered(&self, pool_type: PoolType, slot: &PoolSlot) {
        if slot.store_failing.swap(false, Ordering::SeqCst) {
            info!(%pool_type, "lease store reachable again");
        }
    }
}
