//! Service controller: one reconciliation tick for one service.
//!
//! The controller never blocks on a launch or stop reaching its end state.
//! Each tick observes what the runtime reports, carries out health
//! replacements and pending registrations, then plans and issues the next
//! launches and stops. Everything happens under the caller's service lock.

use std::sync::Arc;

use tracing::{debug, info, warn};

use shoal_autoscale::{MetricUnavailable, ScaleDecision, ScaleDirection, evaluate};
use shoal_balancer::TargetBinding;
use shoal_health::{ProbeResult, ProbeTarget};
use shoal_state::{
    Endpoint, EventKind, RolloutStatus, StateStore, Task, TaskDefinitionStore, TaskId, TaskState,
    Version,
};

use crate::config::ControllerConfig;
use crate::error::FleetResult;
use crate::events::EventLog;
use crate::plan::{self, StopReason};
use crate::runtime::{RuntimeStatus, TaskRuntime};
use crate::state::ServiceState;

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub launched: u32,
    pub stopped: u32,
    pub converged: bool,
}

/// Drives services toward their desired count and target version.
pub struct ServiceController {
    store: StateStore,
    definitions: TaskDefinitionStore,
    runtime: Arc<dyn TaskRuntime>,
    binding: Arc<dyn TargetBinding>,
    events: EventLog,
    config: ControllerConfig,
}

impl ServiceController {
    pub fn new(
        store: StateStore,
        runtime: Arc<dyn TaskRuntime>,
        binding: Arc<dyn TargetBinding>,
        events: EventLog,
        config: ControllerConfig,
    ) -> Self {
        Self {
            definitions: TaskDefinitionStore::new(store.clone()),
            store,
            runtime,
            binding,
            events,
            config,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Run one reconciliation tick at `now`.
    pub async fn tick(&self, st: &mut ServiceState, now: u64) -> FleetResult<TickReport> {
        self.observe(st, now).await?;
        self.register_healthy(st, now).await;

        let mut report = TickReport::default();
        for id in st.ids_in(TaskState::Unhealthy) {
            self.begin_stop(st, &id, StopReason::Unhealthy, now).await;
            report.stopped += 1;
        }

        let can_launch = !st.is_stalled() && st.launches.is_due(now);
        let plan = plan::plan(
            st.service.desired_count,
            st.service.target_version,
            &st.service.rolling_policy,
            &st.task_list(),
            can_launch,
        );
        if !plan.is_empty() {
            debug!(
                service = %st.id(),
                launch = plan.launch,
                stop = plan.stop.len(),
                "reconcile plan"
            );
        }

        for (id, reason) in &plan.stop {
            self.begin_stop(st, id, *reason, now).await;
            report.stopped += 1;
        }
        if plan.launch > 0 {
            report.launched = self.launch(st, plan.launch, now).await?;
        }

        report.converged = self.update_rollout(st, now);
        self.persist(st, now)?;
        Ok(report)
    }

    // ── Observation ────────────────────────────────────────────────

    /// Pending tasks that die in the same pass count as one launch failure:
    /// they were launched together and share one backoff.
    async fn observe(&self, st: &mut ServiceState, now: u64) -> FleetResult<()> {
        let mut failed_launch: Option<(Version, String)> = None;
        for task in st.task_list() {
            let status = match self.runtime.status(&task).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(service = %st.id(), task_id = %task.id, error = %e, "runtime status unavailable");
                    continue;
                }
            };

            match (task.state, status) {
                (TaskState::Pending, RuntimeStatus::Running { endpoint }) => {
                    self.mark_running(st, &task, endpoint, now)?;
                }
                (TaskState::Pending, RuntimeStatus::Exited { code }) => {
                    st.remove_task(&task.id);
                    self.emit(st, now, EventKind::TaskStopped { task_id: task.id.clone() });
                    let error = format!("task {} exited before running (code {code:?})", task.id);
                    failed_launch = Some((task.version, error));
                }
                (TaskState::Pending, RuntimeStatus::Unknown) => {
                    st.remove_task(&task.id);
                    self.emit(st, now, EventKind::TaskStopped { task_id: task.id.clone() });
                    let error = format!("task {} lost by runtime before running", task.id);
                    failed_launch = Some((task.version, error));
                }
                (
                    TaskState::Running | TaskState::Healthy | TaskState::Unhealthy,
                    RuntimeStatus::Exited { .. } | RuntimeStatus::Unknown,
                ) => {
                    warn!(service = %st.id(), task_id = %task.id, state = %task.state, "task exited unexpectedly");
                    self.deregister(st, &task, now).await;
                    st.remove_task(&task.id);
                    self.emit(st, now, EventKind::TaskStopped { task_id: task.id.clone() });
                }
                (TaskState::Stopping, RuntimeStatus::Exited { .. } | RuntimeStatus::Unknown)
                | (TaskState::Stopped, _) => {
                    st.remove_task(&task.id);
                    self.emit(st, now, EventKind::TaskStopped { task_id: task.id.clone() });
                }
                (TaskState::Stopping, _) if st.drain_elapsed(&task.id, now) => {
                    st.draining.remove(&task.id);
                    debug!(service = %st.id(), task_id = %task.id, "drain elapsed");
                    self.stop_task(st, &task).await;
                }
                (TaskState::Stopping, _) if st.stop_retry.contains(&task.id) => {
                    match self.runtime.stop(&task).await {
                        Ok(()) => {
                            st.stop_retry.remove(&task.id);
                        }
                        Err(e) => {
                            warn!(service = %st.id(), task_id = %task.id, error = %e, "stop retry failed");
                        }
                    }
                }
                _ => {}
            }
        }
        if let Some((version, error)) = failed_launch {
            self.launch_failed(st, version, error, now);
        }
        Ok(())
    }

    fn mark_running(
        &self,
        st: &mut ServiceState,
        task: &Task,
        endpoint: Endpoint,
        now: u64,
    ) -> FleetResult<()> {
        let definition = self.definitions.get(task.version)?;
        if let Some(t) = st.tasks.get_mut(&task.id) {
            t.state = TaskState::Running;
            t.running_since = Some(now);
            t.endpoint = Some(endpoint.clone());
            t.updated_at = now;
        }
        st.health.watch(&task.id, &definition.health, now);
        st.launches.reset();
        self.emit(
            st,
            now,
            EventKind::TaskRunning {
                task_id: task.id.clone(),
                endpoint,
            },
        );
        Ok(())
    }

    // ── Load balancer ──────────────────────────────────────────────

    async fn register_healthy(&self, st: &mut ServiceState, now: u64) {
        let ready: Vec<(TaskId, Endpoint)> = st
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Healthy && !t.registered)
            .filter_map(|t| t.endpoint.clone().map(|ep| (t.id.clone(), ep)))
            .filter(|(id, _)| st.registrations.is_due(id, now))
            .collect();

        for (id, endpoint) in ready {
            match self.binding.register(&endpoint).await {
                Ok(()) => {
                    st.registrations.record_success(&id);
                    if let Some(t) = st.tasks.get_mut(&id) {
                        t.registered = true;
                        t.updated_at = now;
                    }
                    self.emit(st, now, EventKind::TargetRegistered { task_id: id, endpoint });
                }
                Err(e) => {
                    let attempt = st.registrations.record_failure(&id, now);
                    self.emit(
                        st,
                        now,
                        EventKind::RegistrationFailed {
                            task_id: id,
                            attempt,
                            error: e.to_string(),
                        },
                    );
                }
            }
        }
    }

    async fn deregister(&self, st: &mut ServiceState, task: &Task, now: u64) {
        let (true, Some(endpoint)) = (task.registered, &task.endpoint) else {
            return;
        };
        if let Err(e) = self.binding.deregister(endpoint).await {
            self.emit(
                st,
                now,
                EventKind::DeregistrationFailed {
                    task_id: task.id.clone(),
                    error: e.to_string(),
                },
            );
        }
        if let Some(t) = st.tasks.get_mut(&task.id) {
            t.registered = false;
        }
    }

    // ── Stop and launch ────────────────────────────────────────────

    /// Deregister a task, then ask the runtime to stop it. A task that was
    /// taking traffic keeps running for the drain delay first.
    async fn begin_stop(&self, st: &mut ServiceState, task_id: &str, reason: StopReason, now: u64) {
        let Some(task) = st.tasks.get(task_id).cloned() else {
            return;
        };
        if !task.state.is_live() {
            return;
        }

        self.deregister(st, &task, now).await;
        st.health.forget(task_id);
        st.registrations.forget(task_id);

        let drain = self.config.drain.as_millis() as u64;
        if task.registered && drain > 0 {
            st.draining.insert(task_id.to_string(), now.saturating_add(drain));
        } else {
            self.stop_task(st, &task).await;
        }
        if let Some(t) = st.tasks.get_mut(task_id) {
            t.state = TaskState::Stopping;
            t.updated_at = now;
        }
        self.emit(
            st,
            now,
            EventKind::TaskStopping {
                task_id: task_id.to_string(),
                reason: reason.to_string(),
            },
        );
    }

    async fn stop_task(&self, st: &mut ServiceState, task: &Task) {
        if let Err(e) = self.runtime.stop(task).await {
            warn!(service = %st.id(), task_id = %task.id, error = %e, "stop request failed, will retry");
            st.stop_retry.insert(task.id.clone());
        }
    }

    /// Launch up to `count` target-version tasks. Stops at the first failure.
    async fn launch(&self, st: &mut ServiceState, count: u32, now: u64) -> FleetResult<u32> {
        let definition = self.definitions.get(st.service.target_version)?;
        let mut launched = 0;
        for _ in 0..count {
            let id = st.service.next_task_id();
            let task = Task::new(id, &st.service.id, definition.version, now);
            match self.runtime.launch(&task, &definition).await {
                Ok(()) => {
                    self.emit(
                        st,
                        now,
                        EventKind::TaskLaunched {
                            task_id: task.id.clone(),
                            version: task.version,
                        },
                    );
                    st.insert_task(task);
                    launched += 1;
                }
                Err(e) => {
                    self.launch_failed(st, definition.version, e.to_string(), now);
                    break;
                }
            }
        }
        Ok(launched)
    }

    fn launch_failed(&self, st: &mut ServiceState, version: Version, error: String, now: u64) {
        let attempt = st
            .launches
            .record_failure(now, &self.config.launch_backoff);
        self.emit(
            st,
            now,
            EventKind::LaunchFailed {
                version,
                attempt,
                error: error.clone(),
            },
        );

        if attempt >= self.config.max_launch_attempts && !st.is_stalled() {
            let reason = format!("{attempt} consecutive launch failures, last: {error}");
            st.service.rollout = RolloutStatus::Stalled {
                reason: reason.clone(),
            };
            self.emit(st, now, EventKind::RolloutStalled { version, reason });
        }
    }

    // ── Rollout status ─────────────────────────────────────────────

    /// Move the rollout status along; returns whether the service converged.
    fn update_rollout(&self, st: &mut ServiceState, now: u64) -> bool {
        let converged = plan::is_converged(
            st.service.desired_count,
            st.service.target_version,
            &st.task_list(),
        );
        match (&st.service.rollout, converged) {
            (RolloutStatus::InProgress, true) => {
                st.service.rollout = RolloutStatus::Completed;
                let kind = EventKind::RolloutCompleted {
                    version: st.service.target_version,
                    desired: st.service.desired_count,
                };
                self.emit(st, now, kind);
            }
            (RolloutStatus::Completed, false) => {
                debug!(service = %st.id(), "service drifted from target, reconciling");
                st.service.rollout = RolloutStatus::InProgress;
            }
            _ => {}
        }
        converged
    }

    // ── Health ─────────────────────────────────────────────────────

    /// Probe targets for every task whose next probe is due at `now`.
    pub fn due_probes(&self, st: &ServiceState, now: u64) -> FleetResult<Vec<ProbeTarget>> {
        let mut targets = Vec::new();
        for id in st.health.due(now) {
            let Some(task) = st.tasks.get(&id) else {
                continue;
            };
            let definition = self.definitions.get(task.version)?;
            targets.push(ProbeTarget {
                task_id: id,
                endpoint: task.endpoint.clone(),
                command: definition.health.command,
                env: definition.env,
                timeout: definition.health.timeout,
            });
        }
        Ok(targets)
    }

    /// Feed probe results back into the trackers and task states.
    pub fn record_health(
        &self,
        st: &mut ServiceState,
        results: Vec<(TaskId, ProbeResult)>,
        now: u64,
    ) -> FleetResult<()> {
        for (id, result) in results {
            let probed = st.tasks.get(&id).is_some_and(|t| {
                matches!(
                    t.state,
                    TaskState::Running | TaskState::Healthy | TaskState::Unhealthy
                )
            });
            if !probed {
                continue;
            }

            let transition = st.health.record(&id, now, result);
            let failures = st.health.failures(&id);
            if let Some(task) = st.tasks.get_mut(&id) {
                task.consecutive_failures = failures;
                task.updated_at = now;
                if let Some(t) = &transition {
                    task.state = t.task_state();
                }
            }
            if let Some(kind) = transition.and_then(|t| t.event_kind()) {
                self.emit(st, now, kind);
            }
        }
        self.persist(st, now)
    }

    // ── Autoscaling ────────────────────────────────────────────────

    /// Evaluate the scaling policy against a sampled metric and write the
    /// new desired count if warranted.
    pub fn apply_scaling(
        &self,
        st: &mut ServiceState,
        metric: Result<f64, MetricUnavailable>,
        now: u64,
    ) -> FleetResult<ScaleDecision> {
        let Some(policy) = st.service.scaling_policy.clone() else {
            return Ok(ScaleDecision::NoChange);
        };
        let sampled = metric.as_ref().ok().copied().unwrap_or_default();
        let from = st.service.desired_count;
        let decision = evaluate(&policy, &st.scale, from, metric, now);

        match &decision {
            ScaleDecision::ScaleTo(to) => {
                let to = *to;
                let (direction, kind) = if to > from {
                    (ScaleDirection::Out, EventKind::ScaledOut { from, to, metric: sampled })
                } else {
                    (ScaleDirection::In, EventKind::ScaledIn { from, to, metric: sampled })
                };
                st.service.desired_count = to;
                st.scale.record_write(now, direction);
                if st.service.rollout == RolloutStatus::Completed {
                    st.service.rollout = RolloutStatus::InProgress;
                }
                info!(service = %st.id(), from, to, metric = sampled, %direction, "desired count scaled");
                self.emit(st, now, kind);
                self.persist(st, now)?;
            }
            ScaleDecision::MetricUnavailable(e) => {
                self.emit(st, now, EventKind::MetricUnavailable { error: e.to_string() });
            }
            ScaleDecision::NoChange | ScaleDecision::CoolingDown { .. } => {}
        }
        Ok(decision)
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn emit(&self, st: &ServiceState, now: u64, kind: EventKind) {
        self.events.emit(st.id(), now, kind);
    }

    /// Write the service record and its tasks in one transaction.
    pub fn persist(&self, st: &mut ServiceState, now: u64) -> FleetResult<()> {
        st.service.updated_at = now;
        let service = st.service.clone();
        let tasks = st.task_list();
        st.flush_removed(|removed| self.store.save_service_state(&service, &tasks, removed))?;
        Ok(())
    }
}
