//! Task definition store.
//!
//! Definitions are immutable: `register` validates a spec and stores it
//! under the next monotonic version, `get` reads one back. There is no
//! update or delete; a change is always a new version.

use tracing::info;

use crate::error::DefinitionError;
use crate::store::StateStore;
use crate::types::{TaskDefinition, TaskDefinitionSpec, Version, epoch_millis};

/// Versioned, read-mostly store of task definitions.
///
/// Cheap to clone; all clones share the same underlying database.
#[derive(Clone)]
pub struct TaskDefinitionStore {
    store: StateStore,
}

impl TaskDefinitionStore {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Validate and persist a definition, returning its assigned version.
    pub fn register(&self, spec: TaskDefinitionSpec) -> Result<Version, DefinitionError> {
        spec.validate()?;
        let definition = self.store.insert_definition(spec, epoch_millis())?;
        info!(
            version = definition.version,
            image = %definition.image,
            "task definition registered"
        );
        Ok(definition.version)
    }

    /// Fetch a definition by version.
    pub fn get(&self, version: Version) -> Result<TaskDefinition, DefinitionError> {
        self.store
            .get_definition(version)?
            .ok_or(DefinitionError::NotFound(version))
    }

    /// The newest registered definition.
    pub fn latest(&self) -> Result<Option<TaskDefinition>, DefinitionError> {
        Ok(self.store.latest_definition()?)
    }

    /// All definitions in version order.
    pub fn list(&self) -> Result<Vec<TaskDefinition>, DefinitionError> {
        Ok(self.store.list_definitions()?)
    }
}
