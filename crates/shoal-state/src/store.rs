//! StateStore: redb-backed state persistence for Shoal.
//!
//! Provides typed operations over task definitions, services, tasks and
//! deployment events. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(DEFINITIONS).map_err(map_err!(Table))?;
        txn.open_table(SERVICES).map_err(map_err!(Table))?;
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(EVENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Task definitions ───────────────────────────────────────────

    /// Store a definition under the next version number.
    ///
    /// The version is read and written in one write transaction, so
    /// concurrent registrations always get distinct, increasing versions.
    pub fn insert_definition(
        &self,
        spec: TaskDefinitionSpec,
        now: u64,
    ) -> StateResult<TaskDefinition> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let definition;
        {
            let mut table = txn.open_table(DEFINITIONS).map_err(map_err!(Table))?;
            let last = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(k, _)| k.value())
                .unwrap_or(0);
            definition = spec.into_definition(last + 1, now);
            let value = serde_json::to_vec(&definition).map_err(map_err!(Serialize))?;
            table
                .insert(definition.version, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(version = definition.version, image = %definition.image, "task definition stored");
        Ok(definition)
    }

    /// Get a definition by version.
    pub fn get_definition(&self, version: Version) -> StateResult<Option<TaskDefinition>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEFINITIONS).map_err(map_err!(Table))?;
        match table.get(version).map_err(map_err!(Read))? {
            Some(guard) => {
                let def: TaskDefinition =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(def))
            }
            None => Ok(None),
        }
    }

    /// The highest registered version, if any.
    pub fn latest_definition(&self) -> StateResult<Option<TaskDefinition>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEFINITIONS).map_err(map_err!(Table))?;
        match table.last().map_err(map_err!(Read))? {
            Some((_, value)) => {
                let def: TaskDefinition =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(def))
            }
            None => Ok(None),
        }
    }

    /// List all definitions in version order.
    pub fn list_definitions(&self) -> StateResult<Vec<TaskDefinition>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEFINITIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let def: TaskDefinition =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(def);
        }
        Ok(results)
    }

    // ── Services ───────────────────────────────────────────────────

    /// Insert or update a service.
    pub fn put_service(&self, service: &Service) -> StateResult<()> {
        let value = serde_json::to_vec(service).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            table
                .insert(service.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(service = %service.id, "service stored");
        Ok(())
    }

    /// Get a service by id.
    pub fn get_service(&self, id: &str) -> StateResult<Option<Service>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let svc: Service =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(svc))
            }
            None => Ok(None),
        }
    }

    /// List all services.
    pub fn list_services(&self) -> StateResult<Vec<Service>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let svc: Service =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(svc);
        }
        Ok(results)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Insert or update a task.
    pub fn put_task(&self, task: &Task) -> StateResult<()> {
        let key = task.table_key();
        let value = serde_json::to_vec(task).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List all tasks for a given service.
    pub fn list_tasks_for_service(&self, service_id: &str) -> StateResult<Vec<Task>> {
        let prefix = format!("{service_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let task: Task = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(task);
        }
        Ok(results)
    }

    /// Delete a task by its composite key. Returns true if it existed.
    pub fn delete_task(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Persist a service together with its live tasks and drop removed ones,
    /// all in one write transaction.
    pub fn save_service_state(
        &self,
        service: &Service,
        tasks: &[Task],
        removed: &[TaskId],
    ) -> StateResult<()> {
        let service_value = serde_json::to_vec(service).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut services = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            services
                .insert(service.id.as_str(), service_value.as_slice())
                .map_err(map_err!(Write))?;

            let mut table = txn.open_table(TASKS).map_err(map_err!(Table))?;
            for task in tasks {
                let value = serde_json::to_vec(task).map_err(map_err!(Serialize))?;
                table
                    .insert(task.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            for task_id in removed {
                let key = format!("{}:{}", service.id, task_id);
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Deployment events ──────────────────────────────────────────

    /// Append an event, assigning it the next sequence number.
    pub fn append_event(&self, event: &DeploymentEvent) -> StateResult<DeploymentEvent> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored;
        {
            let mut table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            let last = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(k, _)| k.value())
                .unwrap_or(0);
            stored = DeploymentEvent {
                seq: last + 1,
                ..event.clone()
            };
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(stored.seq, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(stored)
    }

    /// The most recent `limit` events for a service, oldest first.
    pub fn list_events_for_service(
        &self,
        service_id: &str,
        limit: usize,
    ) -> StateResult<Vec<DeploymentEvent>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let event: DeploymentEvent =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if event.service_id == service_id {
                results.push(event);
                if results.len() >= limit {
                    break;
                }
            }
        }
        results.reverse();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn test_spec(image: &str) -> TaskDefinitionSpec {
        TaskDefinitionSpec {
            image: image.to_string(),
            limits: ResourceLimits {
                cpu_units: 256,
                memory_mib: 512,
            },
            env: BTreeMap::from([("RUST_LOG".to_string(), "info".to_string())]),
            port: 8080,
            health: HealthProbeSpec {
                command: vec!["curl".into(), "-f".into(), "localhost:8080/healthz".into()],
                interval: Duration::from_secs(30),
                timeout: Duration::from_secs(5),
                retries: 3,
                start_period: Duration::from_secs(60),
            },
        }
    }

    fn test_service(id: &str) -> Service {
        Service {
            id: id.to_string(),
            desired_count: 2,
            target_version: 1,
            rolling_policy: RollingUpdatePolicy::default(),
            scaling_policy: None,
            task_ids: Vec::new(),
            rollout: RolloutStatus::InProgress,
            next_task_seq: 0,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_task(service: &str, id: &str) -> Task {
        Task::new(id.to_string(), service, 1, 1000)
    }

    // ── Definitions ────────────────────────────────────────────────

    #[test]
    fn definitions_get_monotonic_versions() {
        let store = StateStore::open_in_memory().unwrap();
        let a = store.insert_definition(test_spec("web:1"), 10).unwrap();
        let b = store.insert_definition(test_spec("web:2"), 20).unwrap();
        assert_eq!(a.version, 1);
        assert_eq!(b.version, 2);
        assert_eq!(store.get_definition(2).unwrap(), Some(b.clone()));
        assert_eq!(store.latest_definition().unwrap(), Some(b));
        assert_eq!(store.list_definitions().unwrap().len(), 2);
    }

    #[test]
    fn definition_get_missing_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_definition(7).unwrap().is_none());
        assert!(store.latest_definition().unwrap().is_none());
    }

    // ── Services and tasks ─────────────────────────────────────────

    #[test]
    fn service_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let svc = test_service("web");
        store.put_service(&svc).unwrap();
        assert_eq!(store.get_service("web").unwrap(), Some(svc));
        assert!(store.get_service("nope").unwrap().is_none());
    }

    #[test]
    fn tasks_are_scoped_by_service_prefix() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_task(&test_task("web", "web-00001")).unwrap();
        store.put_task(&test_task("web", "web-00002")).unwrap();
        store.put_task(&test_task("web-admin", "web-admin-00001")).unwrap();

        let web = store.list_tasks_for_service("web").unwrap();
        assert_eq!(web.len(), 2);
        assert!(web.iter().all(|t| t.service_id == "web"));
        assert_eq!(store.list_tasks_for_service("web-admin").unwrap().len(), 1);
    }

    #[test]
    fn save_service_state_upserts_and_removes() {
        let store = StateStore::open_in_memory().unwrap();
        let mut svc = test_service("web");
        let t1 = test_task("web", "web-00001");
        let t2 = test_task("web", "web-00002");
        svc.task_ids = vec![t1.id.clone(), t2.id.clone()];
        store.save_service_state(&svc, &[t1.clone(), t2], &[]).unwrap();
        assert_eq!(store.list_tasks_for_service("web").unwrap().len(), 2);

        svc.task_ids = vec![t1.id.clone()];
        store
            .save_service_state(&svc, &[t1], &["web-00002".to_string()])
            .unwrap();
        let tasks = store.list_tasks_for_service("web").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(store.get_service("web").unwrap().unwrap().task_ids.len(), 1);
        assert!(!store.delete_task("web:web-00002").unwrap());
    }

    // ── Events ─────────────────────────────────────────────────────

    #[test]
    fn events_append_and_filter() {
        let store = StateStore::open_in_memory().unwrap();
        for (svc, at) in [("web", 1), ("api", 2), ("web", 3), ("web", 4)] {
            let ev = DeploymentEvent::new(
                svc,
                at,
                EventKind::TaskStopped {
                    task_id: format!("{svc}-{at}"),
                },
            );
            store.append_event(&ev).unwrap();
        }

        let web = store.list_events_for_service("web", 10).unwrap();
        assert_eq!(web.iter().map(|e| e.at).collect::<Vec<_>>(), vec![1, 3, 4]);
        assert_eq!(web[0].seq, 1);

        let latest = store.list_events_for_service("web", 2).unwrap();
        assert_eq!(latest.iter().map(|e| e.at).collect::<Vec<_>>(), vec![3, 4]);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.insert_definition(test_spec("web:1"), 10).unwrap();
            store.put_service(&test_service("web")).unwrap();
        }

        // Reopen the same database file; versions keep counting.
        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_service("web").unwrap().is_some());
        let next = store.insert_definition(test_spec("web:2"), 20).unwrap();
        assert_eq!(next.version, 2);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_services().unwrap().is_empty());
        assert!(store.list_definitions().unwrap().is_empty());
        assert!(store.list_tasks_for_service("any").unwrap().is_empty());
        assert!(store.list_events_for_service("any", 10).unwrap().is_empty());
        assert!(!store.delete_task("nope").unwrap());
    }
}
