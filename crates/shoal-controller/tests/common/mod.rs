//! Fakes and a step-driven harness for controller integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use shoal_autoscale::ManualMetrics;
use shoal_balancer::{BindingError, TargetBinding, TargetGroup};
use shoal_controller::{
    ControllerConfig, CreateService, Fleet, FleetParts, RuntimeError, RuntimeStatus,
    ServiceSnapshot, TaskRuntime,
};
use shoal_health::{HealthProbe, ProbeResult, ProbeTarget};
use shoal_state::{
    Backoff, Endpoint, HealthProbeSpec, ResourceLimits, RollingUpdatePolicy, StateStore, Task,
    TaskDefinition, TaskDefinitionSpec, TaskId, Version,
};

/// Simulated time between harness steps.
pub const STEP_MS: u64 = 2_000;

/// Ordered record of external side effects.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

// ── Runtime ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Proc {
    status: RuntimeStatus,
}

/// Launched tasks report RUNNING on the next observation; stopped tasks
/// report EXITED.
pub struct FakeRuntime {
    procs: Mutex<HashMap<TaskId, Proc>>,
    failing_versions: Mutex<HashSet<Version>>,
    held_pending: Mutex<bool>,
    next_port: AtomicU16,
    journal: Journal,
}

impl FakeRuntime {
    pub fn new(journal: Journal) -> Self {
        Self {
            procs: Mutex::new(HashMap::new()),
            failing_versions: Mutex::new(HashSet::new()),
            held_pending: Mutex::new(false),
            next_port: AtomicU16::new(20_000),
            journal,
        }
    }

    /// Every launch of `version` fails with a capacity error.
    pub fn fail_version(&self, version: Version) {
        self.failing_versions.lock().unwrap().insert(version);
    }

    /// Keep new launches PENDING until released.
    pub fn hold_pending(&self, hold: bool) {
        *self.held_pending.lock().unwrap() = hold;
    }

    /// The process of `task_id` dies.
    pub fn crash(&self, task_id: &str) {
        if let Some(p) = self.procs.lock().unwrap().get_mut(task_id) {
            p.status = RuntimeStatus::Exited { code: Some(137) };
        }
    }

    pub fn launched(&self) -> usize {
        self.procs.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskRuntime for FakeRuntime {
    async fn launch(&self, task: &Task, definition: &TaskDefinition) -> Result<(), RuntimeError> {
        if self
            .failing_versions
            .lock()
            .unwrap()
            .contains(&definition.version)
        {
            self.journal.push(format!("launch-failed {}", task.id));
            return Err(RuntimeError::Capacity("no room on host".into()));
        }
        let mut procs = self.procs.lock().unwrap();
        if procs.contains_key(&task.id) {
            return Ok(());
        }
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let status = if *self.held_pending.lock().unwrap() {
            RuntimeStatus::Pending
        } else {
            RuntimeStatus::Running {
                endpoint: Endpoint::new("10.0.0.1", port),
            }
        };
        procs.insert(task.id.clone(), Proc { status });
        self.journal.push(format!("launch {}", task.id));
        Ok(())
    }

    async fn status(&self, task: &Task) -> Result<RuntimeStatus, RuntimeError> {
        Ok(self
            .procs
            .lock()
            .unwrap()
            .get(&task.id)
            .map(|p| p.status.clone())
            .unwrap_or(RuntimeStatus::Unknown))
    }

    async fn stop(&self, task: &Task) -> Result<(), RuntimeError> {
        if let Some(p) = self.procs.lock().unwrap().get_mut(&task.id) {
            p.status = RuntimeStatus::Exited { code: Some(0) };
        }
        self.journal.push(format!("stop {}", task.id));
        Ok(())
    }
}

// ── Health probe ──────────────────────────────────────────────────

/// Healthy unless the task id or its version was marked failing.
#[derive(Default)]
pub struct FakeProbe {
    failing_tasks: Mutex<HashSet<TaskId>>,
}

impl FakeProbe {
    pub fn fail_task(&self, task_id: &str) {
        self.failing_tasks.lock().unwrap().insert(task_id.to_string());
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self, target: &ProbeTarget) -> ProbeResult {
        if self.failing_tasks.lock().unwrap().contains(&target.task_id) {
            ProbeResult::Unhealthy { exit_code: Some(1) }
        } else {
            ProbeResult::Healthy
        }
    }
}

// ── Load balancer ─────────────────────────────────────────────────

/// A target group that can be told to reject the next registrations.
pub struct FakeBinding {
    pub group: TargetGroup,
    reject_next: AtomicU32,
    journal: Journal,
}

impl FakeBinding {
    pub fn new(journal: Journal) -> Self {
        Self {
            group: TargetGroup::new("test"),
            reject_next: AtomicU32::new(0),
            journal,
        }
    }

    pub fn reject_next(&self, n: u32) {
        self.reject_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl TargetBinding for FakeBinding {
    async fn register(&self, endpoint: &Endpoint) -> Result<(), BindingError> {
        let rejected = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(BindingError::Unavailable("balancer api down".into()));
        }
        self.journal.push(format!("register {endpoint}"));
        self.group.register(endpoint).await
    }

    async fn deregister(&self, endpoint: &Endpoint) -> Result<(), BindingError> {
        self.journal.push(format!("deregister {endpoint}"));
        self.group.deregister(endpoint).await
    }
}

// ── Harness ───────────────────────────────────────────────────────

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        max_launch_attempts: 3,
        launch_backoff: Backoff::new(Duration::from_millis(500), Duration::from_millis(500)),
        registration_backoff: Backoff::new(Duration::from_millis(500), Duration::from_millis(500)),
        drain: Duration::ZERO,
        ..ControllerConfig::default()
    }
}

pub fn definition(image: &str) -> TaskDefinitionSpec {
    TaskDefinitionSpec {
        image: image.to_string(),
        limits: ResourceLimits {
            cpu_units: 256,
            memory_mib: 512,
        },
        env: BTreeMap::from([("MODE".to_string(), "test".to_string())]),
        port: 8080,
        health: HealthProbeSpec {
            command: vec!["/bin/check".to_string()],
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(1),
            retries: 2,
            start_period: Duration::ZERO,
        },
    }
}

pub fn policy(max_percent: u32, min_healthy_percent: u32) -> RollingUpdatePolicy {
    RollingUpdatePolicy {
        max_percent,
        min_healthy_percent,
    }
}

pub struct Harness {
    pub fleet: Fleet,
    pub store: StateStore,
    pub runtime: Arc<FakeRuntime>,
    pub probe: Arc<FakeProbe>,
    pub binding: Arc<FakeBinding>,
    pub metrics: ManualMetrics,
    pub journal: Journal,
    pub now: u64,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(StateStore::open_in_memory().unwrap(), test_config())
    }

    pub fn with_store(store: StateStore, config: ControllerConfig) -> Self {
        let journal = Journal::default();
        let runtime = Arc::new(FakeRuntime::new(journal.clone()));
        Self::with_runtime(store, config, runtime, journal)
    }

    pub fn with_runtime(
        store: StateStore,
        config: ControllerConfig,
        runtime: Arc<FakeRuntime>,
        journal: Journal,
    ) -> Self {
        let probe = Arc::new(FakeProbe::default());
        let binding = Arc::new(FakeBinding::new(journal.clone()));
        let metrics = ManualMetrics::new();
        let fleet = Fleet::new(
            store.clone(),
            FleetParts {
                runtime: runtime.clone(),
                binding: binding.clone(),
                probe: probe.clone(),
                metrics: Arc::new(metrics.clone()),
            },
            config,
        );
        Self {
            fleet,
            store,
            runtime,
            probe,
            binding,
            metrics,
            journal,
            now: 1_000_000,
        }
    }

    /// Register `image` as a definition and create `name` from it.
    pub async fn service(
        &self,
        name: &str,
        image: &str,
        desired: u32,
        rolling: RollingUpdatePolicy,
    ) -> (String, Version) {
        let version = self.fleet.submit(definition(image)).unwrap();
        let id = self
            .fleet
            .create_service(CreateService {
                name: name.to_string(),
                version,
                desired,
                rolling,
            })
            .await
            .unwrap();
        (id, version)
    }

    /// One controller tick, then one health pass, then advance the clock.
    pub async fn step(&mut self, id: &str) -> ServiceSnapshot {
        self.fleet.tick(id, self.now).await.unwrap();
        self.fleet.check_health(id, self.now).await.unwrap();
        self.now += STEP_MS;
        self.fleet.describe_service(id).await.unwrap()
    }

    /// Step until the rollout completes, checking every snapshot.
    /// Returns the number of steps taken.
    pub async fn converge(
        &mut self,
        id: &str,
        max_steps: usize,
        mut check: impl FnMut(&ServiceSnapshot),
    ) -> usize {
        for n in 1..=max_steps {
            let snap = self.step(id).await;
            check(&snap);
            if snap.rollout == shoal_state::RolloutStatus::Completed {
                return n;
            }
        }
        panic!("service {id} did not converge in {max_steps} steps");
    }
}

/// Live plus stopping tasks in a snapshot.
pub fn total(snap: &ServiceSnapshot) -> u32 {
    snap.running_by_version.values().sum::<u32>() + snap.stopping
}

pub fn running(snap: &ServiceSnapshot, version: Version) -> u32 {
    snap.running_by_version.get(&version).copied().unwrap_or(0)
}

pub fn healthy(snap: &ServiceSnapshot, version: Version) -> u32 {
    snap.healthy_by_version.get(&version).copied().unwrap_or(0)
}
