//! Local process runtime.
//!
//! Each task is a `sh -c <image>` child of the daemon, listening on a port
//! taken from a fixed range. The child sees its port as `PORT` along with
//! the definition's environment and `TASK_ID`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use shoal_controller::{RuntimeError, RuntimeStatus, TaskRuntime};
use shoal_state::{Endpoint, Task, TaskDefinition, TaskId};

// ── Port pool ─────────────────────────────────────────────────────

/// Ports handed out to tasks; released ports are reused first.
#[derive(Debug)]
pub struct PortPool {
    next: u32,
    end: u32,
    free: Vec<u16>,
}

impl PortPool {
    pub fn new(first: u16, count: u16) -> Self {
        Self {
            next: first as u32,
            end: (first as u32 + count as u32).min(u16::MAX as u32 + 1),
            free: Vec::new(),
        }
    }

    pub fn take(&mut self) -> Option<u16> {
        if let Some(port) = self.free.pop() {
            return Some(port);
        }
        if self.next < self.end {
            let port = self.next as u16;
            self.next += 1;
            Some(port)
        } else {
            None
        }
    }

    pub fn release(&mut self, port: u16) {
        if !self.free.contains(&port) {
            self.free.push(port);
        }
    }
}

// ── Runtime ───────────────────────────────────────────────────────

struct Proc {
    child: Child,
    endpoint: Endpoint,
}

/// Children that have not yet been seen to exit. An exit is reported once;
/// after that the task is unknown to the runtime.
struct Inner {
    procs: HashMap<TaskId, Proc>,
    ports: PortPool,
}

pub struct LocalRuntime {
    host: String,
    inner: Mutex<Inner>,
}

impl LocalRuntime {
    pub fn new(host: impl Into<String>, first_port: u16, ports: u16) -> Self {
        Self {
            host: host.into(),
            inner: Mutex::new(Inner {
                procs: HashMap::new(),
                ports: PortPool::new(first_port, ports),
            }),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    /// Reap `task_id` if its child has exited, dropping it and returning its
    /// port to the pool.
    fn poll(&mut self, task_id: &str) -> Result<RuntimeStatus, RuntimeError> {
        let Some(proc) = self.procs.get_mut(task_id) else {
            return Ok(RuntimeStatus::Unknown);
        };
        let code = match proc.child.try_wait() {
            Ok(None) => {
                return Ok(RuntimeStatus::Running {
                    endpoint: proc.endpoint.clone(),
                });
            }
            Ok(Some(status)) => status.code(),
            Err(e) => return Err(RuntimeError::Other(e.to_string())),
        };
        let port = proc.endpoint.port;
        self.procs.remove(task_id);
        self.ports.release(port);
        debug!(%task_id, ?code, "task process exited");
        Ok(RuntimeStatus::Exited { code })
    }
}

#[async_trait]
impl TaskRuntime for LocalRuntime {
    async fn launch(&self, task: &Task, definition: &TaskDefinition) -> Result<(), RuntimeError> {
        let mut inner = self.inner();
        if inner.procs.contains_key(&task.id) {
            return Ok(());
        }
        let port = inner
            .ports
            .take()
            .ok_or_else(|| RuntimeError::Capacity("no free ports".to_string()))?;

        let spawned = Command::new("sh")
            .arg("-c")
            .arg(&definition.image)
            .envs(&definition.env)
            .env("PORT", port.to_string())
            .env("TASK_ID", &task.id)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                inner.ports.release(port);
                return Err(RuntimeError::Image(format!("{}: {e}", definition.image)));
            }
        };

        info!(
            task_id = %task.id,
            version = definition.version,
            port,
            pid = child.id(),
            "task process spawned"
        );
        let endpoint = Endpoint::new(self.host.clone(), port);
        inner
            .procs
            .insert(task.id.clone(), Proc { child, endpoint });
        Ok(())
    }

    async fn status(&self, task: &Task) -> Result<RuntimeStatus, RuntimeError> {
        self.inner().poll(&task.id)
    }

    async fn stop(&self, task: &Task) -> Result<(), RuntimeError> {
        let mut inner = self.inner();
        // Already reaped, or launched before a restart: nothing to signal.
        let Some(proc) = inner.procs.get_mut(&task.id) else {
            return Ok(());
        };
        if let Err(e) = proc.child.start_kill() {
            warn!(task_id = %task.id, error = %e, "failed to signal task process");
            return Err(RuntimeError::Other(e.to_string()));
        }
        debug!(task_id = %task.id, "task process signalled");
        Ok(())
    }
}
