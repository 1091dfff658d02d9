//! Fleet: the coordinating owner of all services.
//!
//! Holds one lock per service. Operator calls, the reconciliation tick,
//! health recording and autoscaler writes for a service all go through
//! that lock; different services never contend. `spawn_workers` starts one
//! background loop per service, stopped by a `watch` shutdown channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use shoal_autoscale::{MetricSource, ScaleDecision};
use shoal_balancer::TargetBinding;
use shoal_health::{HealthProbe, probe_all};
use shoal_state::{
    DeploymentEvent, EventKind, RollingUpdatePolicy, RolloutStatus, ScalingPolicy, Service,
    ServiceId, StateStore, TaskDefinitionSpec, TaskDefinitionStore, TaskState, Version,
    epoch_millis, validate_service_name,
};

use crate::config::ControllerConfig;
use crate::controller::{ServiceController, TickReport};
use crate::error::{FleetError, FleetResult};
use crate::events::EventLog;
use crate::runtime::TaskRuntime;
use crate::state::ServiceState;

/// Shared handle to one service's state.
pub type ServiceHandle = Arc<Mutex<ServiceState>>;

/// External collaborators the fleet drives.
pub struct FleetParts {
    pub runtime: Arc<dyn TaskRuntime>,
    pub binding: Arc<dyn TargetBinding>,
    pub probe: Arc<dyn HealthProbe>,
    pub metrics: Arc<dyn MetricSource>,
}

/// Request to create a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateService {
    pub name: String,
    pub version: Version,
    pub desired: u32,
    pub rolling: RollingUpdatePolicy,
}

/// Operator update; unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceUpdate {
    pub version: Option<Version>,
    pub desired: Option<u32>,
    pub rolling: Option<RollingUpdatePolicy>,
}

/// Point-in-time view of a service.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ServiceSnapshot {
    pub id: ServiceId,
    pub desired: u32,
    pub target_version: Version,
    pub rolling: RollingUpdatePolicy,
    /// Live (not stopping) tasks per version.
    pub running_by_version: BTreeMap<Version, u32>,
    pub healthy_by_version: BTreeMap<Version, u32>,
    /// Tasks registered with the load balancer.
    pub registered: u32,
    pub stopping: u32,
    pub rollout: RolloutStatus,
    pub scaling_policy: Option<ScalingPolicy>,
}

impl ServiceSnapshot {
    fn of(st: &ServiceState) -> Self {
        let mut running_by_version = BTreeMap::new();
        let mut healthy_by_version = BTreeMap::new();
        let mut registered = 0;
        let mut stopping = 0;
        for task in st.tasks.values() {
            if task.state == TaskState::Stopping {
                stopping += 1;
                continue;
            }
            if !task.state.is_live() {
                continue;
            }
            *running_by_version.entry(task.version).or_insert(0) += 1;
            if task.state == TaskState::Healthy {
                *healthy_by_version.entry(task.version).or_insert(0) += 1;
            }
            registered += u32::from(task.registered);
        }
        Self {
            id: st.service.id.clone(),
            desired: st.service.desired_count,
            target_version: st.service.target_version,
            rolling: st.service.rolling_policy,
            running_by_version,
            healthy_by_version,
            registered,
            stopping,
            rollout: st.service.rollout.clone(),
            scaling_policy: st.service.scaling_policy.clone(),
        }
    }
}

struct Inner {
    store: StateStore,
    definitions: TaskDefinitionStore,
    controller: ServiceController,
    probe: Arc<dyn HealthProbe>,
    metrics: Arc<dyn MetricSource>,
    services: RwLock<HashMap<ServiceId, ServiceHandle>>,
    workers: Mutex<HashMap<ServiceId, JoinHandle<()>>>,
    /// Set once workers are running; new services get a worker too.
    shutdown: std::sync::Mutex<Option<watch::Receiver<bool>>>,
}

/// Owner of every service, task and definition. Cheap to clone.
#[derive(Clone)]
pub struct Fleet {
    inner: Arc<Inner>,
}

impl Fleet {
    pub fn new(store: StateStore, parts: FleetParts, config: ControllerConfig) -> Self {
        let events = EventLog::new(store.clone());
        let controller =
            ServiceController::new(store.clone(), parts.runtime, parts.binding, events, config);
        Self {
            inner: Arc::new(Inner {
                definitions: TaskDefinitionStore::new(store.clone()),
                store,
                controller,
                probe: parts.probe,
                metrics: parts.metrics,
                services: RwLock::new(HashMap::new()),
                workers: Mutex::new(HashMap::new()),
                shutdown: std::sync::Mutex::new(None),
            }),
        }
    }

    pub fn definitions(&self) -> &TaskDefinitionStore {
        &self.inner.definitions
    }

    // ── Definitions ────────────────────────────────────────────────

    /// Register a task definition, returning its version.
    pub fn submit(&self, spec: TaskDefinitionSpec) -> FleetResult<Version> {
        Ok(self.inner.definitions.register(spec)?)
    }

    // ── Services ───────────────────────────────────────────────────

    pub async fn create_service(&self, req: CreateService) -> FleetResult<ServiceId> {
        validate_service_name(&req.name)?;
        req.rolling.validate()?;
        self.inner.definitions.get(req.version)?;

        let now = epoch_millis();
        let handle = {
            let mut services = self.inner.services.write().await;
            if services.contains_key(&req.name) || self.inner.store.get_service(&req.name)?.is_some()
            {
                return Err(FleetError::ServiceExists(req.name));
            }

            let service = Service {
                id: req.name.clone(),
                desired_count: req.desired,
                target_version: req.version,
                rolling_policy: req.rolling,
                scaling_policy: None,
                task_ids: Vec::new(),
                rollout: RolloutStatus::InProgress,
                next_task_seq: 0,
                created_at: now,
                updated_at: now,
            };
            self.inner.store.put_service(&service)?;
            let st = ServiceState::new(service, self.config().registration_backoff);
            let handle: ServiceHandle = Arc::new(Mutex::new(st));
            services.insert(req.name.clone(), Arc::clone(&handle));
            handle
        };

        info!(service = %req.name, version = req.version, desired = req.desired, "service created");
        self.inner.controller.events().emit(
            &req.name,
            now,
            EventKind::RolloutStarted {
                version: req.version,
                desired: req.desired,
            },
        );
        self.start_worker(&req.name, handle).await;
        Ok(req.name)
    }

    /// Apply an operator update. Supersedes any in-flight target and clears
    /// a stalled rollout.
    pub async fn update_service(&self, id: &str, update: ServiceUpdate) -> FleetResult<()> {
        if let Some(rolling) = &update.rolling {
            rolling.validate()?;
        }
        if let Some(version) = update.version {
            self.inner.definitions.get(version)?;
        }

        let handle = self.handle(id).await?;
        let mut st = handle.lock().await;
        let now = epoch_millis();

        if let Some(version) = update.version {
            st.service.target_version = version;
        }
        if let Some(desired) = update.desired {
            st.service.desired_count = match &st.service.scaling_policy {
                Some(policy) => policy.clamp(desired),
                None => desired,
            };
        }
        if let Some(rolling) = update.rolling {
            st.service.rolling_policy = rolling;
        }
        if st.is_stalled() {
            info!(service = %id, "stalled rollout cleared by operator update");
        }
        st.launches.reset();
        st.service.rollout = RolloutStatus::InProgress;

        info!(
            service = %id,
            version = st.service.target_version,
            desired = st.service.desired_count,
            "service updated"
        );
        let kind = EventKind::RolloutStarted {
            version: st.service.target_version,
            desired: st.service.desired_count,
        };
        self.inner.controller.events().emit(id, now, kind);
        self.inner.controller.persist(&mut st, now)
    }

    pub async fn describe_service(&self, id: &str) -> FleetResult<ServiceSnapshot> {
        let handle = self.handle(id).await?;
        let st = handle.lock().await;
        Ok(ServiceSnapshot::of(&st))
    }

    /// Ids of all services, sorted.
    pub async fn list_services(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self.inner.services.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Target tracking with one cooldown for both directions.
    pub async fn set_scaling_policy(
        &self,
        id: &str,
        target: f64,
        min: u32,
        max: u32,
        cooldown: Duration,
    ) -> FleetResult<()> {
        self.put_scaling_policy(id, ScalingPolicy::symmetric(target, min, max, cooldown))
            .await
    }

    /// Install a scaling policy, clamping the current desired count into
    /// its bounds.
    pub async fn put_scaling_policy(&self, id: &str, policy: ScalingPolicy) -> FleetResult<()> {
        policy.validate()?;
        let handle = self.handle(id).await?;
        let mut st = handle.lock().await;
        let now = epoch_millis();

        let clamped = policy.clamp(st.service.desired_count);
        if clamped != st.service.desired_count {
            info!(
                service = %id,
                from = st.service.desired_count,
                to = clamped,
                "desired count clamped into scaling bounds"
            );
            st.service.desired_count = clamped;
            if st.service.rollout == RolloutStatus::Completed {
                st.service.rollout = RolloutStatus::InProgress;
            }
        }
        info!(
            service = %id,
            target = policy.target_value,
            min = policy.min_capacity,
            max = policy.max_capacity,
            "scaling policy set"
        );
        st.service.scaling_policy = Some(policy);
        self.inner.controller.persist(&mut st, now)
    }

    // ── Events ─────────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.inner.controller.events().subscribe()
    }

    /// The newest `limit` events of a service, oldest first.
    pub fn events(&self, id: &str, limit: usize) -> FleetResult<Vec<DeploymentEvent>> {
        Ok(self.inner.controller.events().history(id, limit)?)
    }

    // ── Reconciliation passes ──────────────────────────────────────

    /// One controller tick for a service.
    pub async fn tick(&self, id: &str, now: u64) -> FleetResult<TickReport> {
        let handle = self.handle(id).await?;
        let mut st = handle.lock().await;
        self.inner.controller.tick(&mut st, now).await
    }

    /// Run the health probes due at `now`. Probes execute without holding
    /// the service lock.
    pub async fn check_health(&self, id: &str, now: u64) -> FleetResult<usize> {
        let handle = self.handle(id).await?;
        let targets = {
            let st = handle.lock().await;
            self.inner.controller.due_probes(&st, now)?
        };
        if targets.is_empty() {
            return Ok(0);
        }

        let results = probe_all(Arc::clone(&self.inner.probe), targets).await;
        let probed = results.len();
        let mut st = handle.lock().await;
        self.inner.controller.record_health(&mut st, results, now)?;
        Ok(probed)
    }

    /// One autoscaler evaluation. The metric is sampled outside the lock;
    /// the read-modify-write of the desired count happens under it.
    pub async fn autoscale(&self, id: &str, now: u64) -> FleetResult<ScaleDecision> {
        let handle = self.handle(id).await?;
        if handle.lock().await.service.scaling_policy.is_none() {
            return Ok(ScaleDecision::NoChange);
        }
        let metric = self.inner.metrics.sample(id).await;
        let mut st = handle.lock().await;
        self.inner.controller.apply_scaling(&mut st, metric, now)
    }

    // ── Restore ────────────────────────────────────────────────────

    /// Rebuild services and tasks from the store. Returns how many services
    /// were loaded.
    pub async fn restore(&self) -> FleetResult<usize> {
        let now = epoch_millis();
        let mut loaded = Vec::new();
        for service in self.inner.store.list_services()? {
            let id = service.id.clone();
            let mut st = ServiceState::new(service, self.config().registration_backoff);
            for task in self.inner.store.list_tasks_for_service(&id)? {
                match task.state {
                    TaskState::Running | TaskState::Healthy | TaskState::Unhealthy => {
                        let definition = self.inner.definitions.get(task.version)?;
                        st.health.restore(
                            &task.id,
                            &definition.health,
                            task.state,
                            task.consecutive_failures,
                            now,
                        );
                    }
                    // Re-issue the stop; the runtime treats it as a no-op if done.
                    TaskState::Stopping => {
                        st.stop_retry.insert(task.id.clone());
                    }
                    TaskState::Pending | TaskState::Stopped => {}
                }
                st.tasks.insert(task.id.clone(), task);
            }
            debug!(service = %id, tasks = st.tasks.len(), "service restored");
            loaded.push((id, Arc::new(Mutex::new(st))));
        }

        let count = loaded.len();
        {
            let mut services = self.inner.services.write().await;
            for (id, handle) in &loaded {
                services.insert(id.clone(), Arc::clone(handle));
            }
        }
        for (id, handle) in loaded {
            self.start_worker(&id, handle).await;
        }
        info!(services = count, "fleet restored from store");
        Ok(count)
    }

    // ── Workers ────────────────────────────────────────────────────

    /// Start one worker per service; services created later get their own
    /// worker as well. Workers exit when `shutdown` flips to `true`.
    pub async fn spawn_workers(&self, shutdown: watch::Receiver<bool>) {
        {
            let mut slot = self
                .inner
                .shutdown
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *slot = Some(shutdown);
        }
        let services: Vec<(ServiceId, ServiceHandle)> = self
            .inner
            .services
            .read()
            .await
            .iter()
            .map(|(id, h)| (id.clone(), Arc::clone(h)))
            .collect();
        for (id, handle) in services {
            self.start_worker(&id, handle).await;
        }
    }

    /// Wait for every worker to exit.
    pub async fn join_workers(&self) {
        let handles: Vec<(ServiceId, JoinHandle<()>)> =
            self.inner.workers.lock().await.drain().collect();
        for (id, handle) in handles {
            if let Err(e) = handle.await {
                error!(service = %id, error = %e, "service worker panicked");
            }
        }
    }

    async fn start_worker(&self, id: &str, handle: ServiceHandle) {
        let shutdown = {
            let slot = self
                .inner
                .shutdown
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match slot.as_ref() {
                Some(rx) => rx.clone(),
                None => return,
            }
        };

        let mut workers = self.inner.workers.lock().await;
        if workers.get(id).is_some_and(|h| !h.is_finished()) {
            return;
        }
        let fleet = self.clone();
        let service_id = id.to_string();
        let join = tokio::spawn(async move {
            fleet.run_worker(service_id, handle, shutdown).await;
        });
        workers.insert(id.to_string(), join);
    }

    async fn run_worker(
        &self,
        id: ServiceId,
        handle: ServiceHandle,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let config = self.config().clone();
        let mut tick = tokio::time::interval(config.tick_interval);
        let mut health = tokio::time::interval(config.health_interval);
        let mut scale = tokio::time::interval(config.autoscale_interval);
        for timer in [&mut tick, &mut health, &mut scale] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        // The first autoscale evaluation waits a full period.
        scale.reset();

        info!(service = %id, tick_ms = config.tick_interval.as_millis() as u64, "service worker started");
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let mut st = handle.lock().await;
                    if let Err(e) = self.inner.controller.tick(&mut st, epoch_millis()).await {
                        error!(service = %id, error = %e, "reconcile tick failed");
                    }
                }
                _ = health.tick() => {
                    if let Err(e) = self.check_health(&id, epoch_millis()).await {
                        warn!(service = %id, error = %e, "health pass failed");
                    }
                }
                _ = scale.tick() => {
                    if let Err(e) = self.autoscale(&id, epoch_millis()).await {
                        warn!(service = %id, error = %e, "autoscale pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!(service = %id, "service worker shutting down");
                    break;
                }
            }
        }
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn config(&self) -> &ControllerConfig {
        self.inner.controller.config()
    }

    async fn handle(&self, id: &str) -> FleetResult<ServiceHandle> {
        self.inner
            .services
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| FleetError::ServiceNotFound(id.to_string()))
    }
}
