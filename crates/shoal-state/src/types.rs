//! Domain types for the Shoal state store.
//!
//! These types represent task definitions, the tasks launched from them,
//! the services that own those tasks, scaling policy and the deployment
//! event trail. All types are serializable to/from JSON for storage in
//! redb tables. Timestamps are Unix epoch milliseconds.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Identifier of a service (its validated name).
pub type ServiceId = String;

/// Identifier of a task, unique within the fleet.
pub type TaskId = String;

/// Monotonic task definition version.
pub type Version = u64;

// ── Task definition ───────────────────────────────────────────────

/// Resource limits applied to every task of a definition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CPU units (1024 = one core).
    pub cpu_units: u32,
    /// Memory limit in MiB.
    pub memory_mib: u32,
}

/// Health probe command and its timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthProbeSpec {
    /// Command executed inside the task's context; exit code 0 is healthy.
    pub command: Vec<String>,
    /// Time between probes once the start period is over.
    pub interval: Duration,
    /// A probe that has not succeeded within this time is a failure.
    pub timeout: Duration,
    /// Consecutive failures before the task is marked unhealthy.
    pub retries: u32,
    /// Grace period after the task starts running before the first probe.
    pub start_period: Duration,
}

/// What an operator submits; becomes a [`TaskDefinition`] once registered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDefinitionSpec {
    pub image: String,
    pub limits: ResourceLimits,
    pub env: BTreeMap<String, String>,
    pub port: u16,
    pub health: HealthProbeSpec,
}

/// Immutable, versioned specification of a runnable unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDefinition {
    pub version: Version,
    pub image: String,
    pub limits: ResourceLimits,
    pub env: BTreeMap<String, String>,
    pub port: u16,
    pub health: HealthProbeSpec,
    pub registered_at: u64,
}

impl TaskDefinitionSpec {
    /// Reject malformed resource limits, probe timing or environment.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.image.trim().is_empty() {
            return Err(ValidationError::Empty { field: "image" });
        }
        if self.limits.cpu_units == 0 {
            return Err(ValidationError::Zero { field: "limits.cpu_units" });
        }
        if self.limits.memory_mib == 0 {
            return Err(ValidationError::Zero { field: "limits.memory_mib" });
        }
        if self.port == 0 {
            return Err(ValidationError::Zero { field: "port" });
        }
        if self.env.keys().any(|k| k.trim().is_empty()) {
            return Err(ValidationError::Empty { field: "env key" });
        }
        self.health.validate()
    }

    pub(crate) fn into_definition(self, version: Version, now: u64) -> TaskDefinition {
        TaskDefinition {
            version,
            image: self.image,
            limits: self.limits,
            env: self.env,
            port: self.port,
            health: self.health,
            registered_at: now,
        }
    }
}

impl HealthProbeSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(ValidationError::Empty { field: "health.command" });
        }
        if self.interval.is_zero() {
            return Err(ValidationError::Zero { field: "health.interval" });
        }
        if self.timeout.is_zero() {
            return Err(ValidationError::Zero { field: "health.timeout" });
        }
        if self.timeout >= self.interval {
            return Err(ValidationError::TimeoutNotBelowInterval {
                timeout_ms: self.timeout.as_millis() as u64,
                interval_ms: self.interval.as_millis() as u64,
            });
        }
        if self.retries == 0 {
            return Err(ValidationError::Zero { field: "health.retries" });
        }
        Ok(())
    }
}

// ── Task ──────────────────────────────────────────────────────────

/// Lifecycle state of a task.
///
/// `Pending → Running → Healthy ⇄ Unhealthy → Stopping → Stopped`.
/// `Stopping` covers the window between deregistration and process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Healthy,
    Unhealthy,
    Stopping,
    Stopped,
}

impl TaskState {
    /// Counts toward the service's running total.
    pub fn is_active(self) -> bool {
        self != TaskState::Stopped
    }

    /// Alive and not marked for stopping.
    pub fn is_live(self) -> bool {
        !matches!(self, TaskState::Stopping | TaskState::Stopped)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Healthy => "healthy",
            TaskState::Unhealthy => "unhealthy",
            TaskState::Stopping => "stopping",
            TaskState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Network endpoint a task serves on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One instance of a task definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub service_id: ServiceId,
    pub version: Version,
    pub state: TaskState,
    pub launched_at: u64,
    /// When the process was observed running (start of the grace period).
    pub running_since: Option<u64>,
    pub consecutive_failures: u32,
    pub endpoint: Option<Endpoint>,
    /// Registered with the load balancer and receiving traffic.
    pub registered: bool,
    pub updated_at: u64,
}

impl Task {
    pub fn new(id: TaskId, service_id: &str, version: Version, now: u64) -> Self {
        Self {
            id,
            service_id: service_id.to_string(),
            version,
            state: TaskState::Pending,
            launched_at: now,
            running_since: None,
            consecutive_failures: 0,
            endpoint: None,
            registered: false,
            updated_at: now,
        }
    }

    /// Build the composite key for the tasks table.
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.service_id, self.id)
    }
}

// ── Service ───────────────────────────────────────────────────────

/// Bounds on fleet size while tasks are being replaced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollingUpdatePolicy {
    /// Upper bound on live tasks, as a percentage of desired count.
    pub max_percent: u32,
    /// Healthy floor, as a percentage of desired count.
    pub min_healthy_percent: u32,
}

impl Default for RollingUpdatePolicy {
    fn default() -> Self {
        Self {
            max_percent: 200,
            min_healthy_percent: 100,
        }
    }
}

fn saturate(n: u64) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

impl RollingUpdatePolicy {
    /// `ceil(desired × maxPercent / 100)`.
    pub fn max_total(&self, desired: u32) -> u32 {
        saturate((desired as u64 * self.max_percent as u64).div_ceil(100))
    }

    /// `ceil(desired × minHealthyPercent / 100)`.
    pub fn min_healthy(&self, desired: u32) -> u32 {
        saturate((desired as u64 * self.min_healthy_percent as u64).div_ceil(100))
    }

    /// `floor(desired × minHealthyPercent / 100)`, the availability floor
    /// the fleet must keep while old tasks are drained.
    pub fn healthy_floor(&self, desired: u32) -> u32 {
        saturate(desired as u64 * self.min_healthy_percent as u64 / 100)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_percent < 100 {
            return Err(ValidationError::OutOfRange {
                field: "max_percent",
                value: self.max_percent as u64,
                expected: ">= 100",
            });
        }
        if self.min_healthy_percent > 100 {
            return Err(ValidationError::OutOfRange {
                field: "min_healthy_percent",
                value: self.min_healthy_percent as u64,
                expected: "<= 100",
            });
        }
        if self.max_percent == 100 && self.min_healthy_percent == 100 {
            // Neither surge nor drain is allowed; a rollout could never move.
            return Err(ValidationError::OutOfRange {
                field: "min_healthy_percent",
                value: 100,
                expected: "< 100 when max_percent is 100",
            });
        }
        Ok(())
    }
}

/// Target-tracking scaling policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingPolicy {
    /// Metric value each task should carry.
    pub target_value: f64,
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub scale_out_cooldown: Duration,
    pub scale_in_cooldown: Duration,
}

impl ScalingPolicy {
    /// Policy with the same cooldown in both directions.
    pub fn symmetric(target_value: f64, min: u32, max: u32, cooldown: Duration) -> Self {
        Self {
            target_value,
            min_capacity: min,
            max_capacity: max,
            scale_out_cooldown: cooldown,
            scale_in_cooldown: cooldown,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.target_value.is_finite() || self.target_value <= 0.0 {
            return Err(ValidationError::Zero { field: "target_value" });
        }
        if self.min_capacity > self.max_capacity {
            return Err(ValidationError::InvertedBounds {
                min: self.min_capacity,
                max: self.max_capacity,
            });
        }
        Ok(())
    }

    /// Clamp a desired count into `[min_capacity, max_capacity]`.
    pub fn clamp(&self, desired: u32) -> u32 {
        desired.clamp(self.min_capacity, self.max_capacity)
    }
}

/// Progress of the service toward its target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RolloutStatus {
    InProgress,
    Completed,
    /// Launches exhausted their retries; needs an operator update to clear.
    Stalled { reason: String },
}

/// The long-lived unit under control.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub id: ServiceId,
    pub desired_count: u32,
    pub target_version: Version,
    pub rolling_policy: RollingUpdatePolicy,
    pub scaling_policy: Option<ScalingPolicy>,
    pub task_ids: Vec<TaskId>,
    pub rollout: RolloutStatus,
    /// Next suffix for generated task ids.
    pub next_task_seq: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Service {
    /// Allocate the next task id for this service.
    pub fn next_task_id(&mut self) -> TaskId {
        self.next_task_seq += 1;
        format!("{}-{:05}", self.id, self.next_task_seq)
    }
}

/// Service names double as ids and table keys.
pub fn validate_service_name(name: &str) -> Result<(), ValidationError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-');
    if valid {
        Ok(())
    } else {
        Err(ValidationError::ServiceName(name.to_string()))
    }
}

// ── Deployment events ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// What happened. One variant per observable transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    TaskLaunched { task_id: TaskId, version: Version },
    TaskRunning { task_id: TaskId, endpoint: Endpoint },
    TaskHealthy { task_id: TaskId },
    TaskUnhealthy { task_id: TaskId, failures: u32 },
    TaskStopping { task_id: TaskId, reason: String },
    TaskStopped { task_id: TaskId },
    LaunchFailed { version: Version, attempt: u32, error: String },
    TargetRegistered { task_id: TaskId, endpoint: Endpoint },
    RegistrationFailed { task_id: TaskId, attempt: u32, error: String },
    DeregistrationFailed { task_id: TaskId, error: String },
    ScaledOut { from: u32, to: u32, metric: f64 },
    ScaledIn { from: u32, to: u32, metric: f64 },
    MetricUnavailable { error: String },
    RolloutStarted { version: Version, desired: u32 },
    RolloutCompleted { version: Version, desired: u32 },
    RolloutStalled { version: Version, reason: String },
}

impl EventKind {
    pub fn severity(&self) -> Severity {
        match self {
            EventKind::TaskUnhealthy { .. }
            | EventKind::LaunchFailed { .. }
            | EventKind::RegistrationFailed { .. }
            | EventKind::DeregistrationFailed { .. }
            | EventKind::MetricUnavailable { .. } => Severity::Warning,
            EventKind::RolloutStalled { .. } => Severity::Error,
            _ => Severity::Info,
        }
    }
}

/// Append-only record of a state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentEvent {
    /// Assigned by the store on append.
    pub seq: u64,
    pub service_id: ServiceId,
    pub at: u64,
    pub severity: Severity,
    pub kind: EventKind,
}

impl DeploymentEvent {
    pub fn new(service_id: &str, at: u64, kind: EventKind) -> Self {
        Self {
            seq: 0,
            service_id: service_id.to_string(),
            at,
            severity: kind.severity(),
            kind,
        }
    }
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
