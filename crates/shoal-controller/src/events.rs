//! Deployment event log: persisted, broadcast and traced.

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use shoal_state::{DeploymentEvent, EventKind, Severity, StateStore};

const CHANNEL_CAPACITY: usize = 1024;

/// Append-only event trail shared by all services.
///
/// Every event is written to the store, logged at a level matching its
/// severity, and sent to live subscribers. A failed write is logged and
/// does not stop the broadcast.
#[derive(Clone)]
pub struct EventLog {
    store: StateStore,
    tx: broadcast::Sender<DeploymentEvent>,
}

impl EventLog {
    pub fn new(store: StateStore) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { store, tx }
    }

    /// Record an event for `service_id` at `at`.
    pub fn emit(&self, service_id: &str, at: u64, kind: EventKind) -> DeploymentEvent {
        let event = DeploymentEvent::new(service_id, at, kind);
        let event = match self.store.append_event(&event) {
            Ok(stored) => stored,
            Err(e) => {
                error!(service = %service_id, error = %e, "failed to persist deployment event");
                event
            }
        };

        match event.severity {
            Severity::Info => info!(service = %service_id, seq = event.seq, kind = ?event.kind, "deployment event"),
            Severity::Warning => warn!(service = %service_id, seq = event.seq, kind = ?event.kind, "deployment event"),
            Severity::Error => error!(service = %service_id, seq = event.seq, kind = ?event.kind, "deployment event"),
        }

        // No receivers is fine.
        let _ = self.tx.send(event.clone());
        event
    }

    /// Live stream of events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.tx.subscribe()
    }

    /// The newest `limit` stored events of a service, oldest first.
    pub fn history(
        &self,
        service_id: &str,
        limit: usize,
    ) -> Result<Vec<DeploymentEvent>, shoal_state::StateError> {
        self.store.list_events_for_service(service_id, limit)
    }
}
